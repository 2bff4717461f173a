//! Message domain events.
//!
//! The set of events is closed: [`EventType`] enumerates every kind, and
//! [`MessageEvent`] carries the payload of exactly one of them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{topics, EventEnvelope};

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    MessageSent,
    MessageRead,
    MessageRevoked,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::MessageSent,
        EventType::MessageRead,
        EventType::MessageRevoked,
    ];

    /// Stable name stored in `outbox_events.event_type` and the `event_type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageSent => "message.sent",
            EventType::MessageRead => "message.read",
            EventType::MessageRevoked => "message.revoked",
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            EventType::MessageSent => topics::MESSAGE_NEW,
            EventType::MessageRead => topics::MESSAGE_READ,
            EventType::MessageRevoked => topics::MESSAGE_REVOKED,
        }
    }

    pub fn from_topic(topic: &str) -> Result<Self, SchemaError> {
        Self::ALL
            .into_iter()
            .find(|t| t.topic() == topic)
            .ok_or_else(|| SchemaError::UnknownTopic(topic.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SchemaError::UnknownEventType(s.to_string()))
    }
}

/// A message was committed and must be fanned out to `receiver_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSent {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_ids: Vec<Uuid>,
    pub seq: i64,
    pub content_type: i16,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A member advanced their read watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRead {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub receiver_ids: Vec<Uuid>,
    pub read_seq: i64,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRevoked {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    Sent(MessageSent),
    Read(MessageRead),
    Revoked(MessageRevoked),
}

impl MessageEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            MessageEvent::Sent(_) => EventType::MessageSent,
            MessageEvent::Read(_) => EventType::MessageRead,
            MessageEvent::Revoked(_) => EventType::MessageRevoked,
        }
    }

    /// Partition key: every event of one conversation lands on one partition.
    pub fn conversation_id(&self) -> Uuid {
        match self {
            MessageEvent::Sent(e) => e.conversation_id,
            MessageEvent::Read(e) => e.conversation_id,
            MessageEvent::Revoked(e) => e.conversation_id,
        }
    }

    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            MessageEvent::Sent(e) => Some(e.message_id),
            MessageEvent::Read(_) => None,
            MessageEvent::Revoked(e) => Some(e.message_id),
        }
    }

    /// Entity the event is about: the message, or the conversation for read receipts.
    pub fn aggregate_id(&self) -> Uuid {
        self.message_id().unwrap_or_else(|| self.conversation_id())
    }

    pub fn receiver_ids(&self) -> &[Uuid] {
        match self {
            MessageEvent::Sent(e) => &e.receiver_ids,
            MessageEvent::Read(e) => &e.receiver_ids,
            MessageEvent::Revoked(e) => &e.receiver_ids,
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, SchemaError> {
        let value = match self {
            MessageEvent::Sent(e) => serde_json::to_value(e)?,
            MessageEvent::Read(e) => serde_json::to_value(e)?,
            MessageEvent::Revoked(e) => serde_json::to_value(e)?,
        };
        Ok(value)
    }

    pub fn from_payload(
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Self, SchemaError> {
        let event = match event_type {
            EventType::MessageSent => MessageEvent::Sent(serde_json::from_value(payload)?),
            EventType::MessageRead => MessageEvent::Read(serde_json::from_value(payload)?),
            EventType::MessageRevoked => MessageEvent::Revoked(serde_json::from_value(payload)?),
        };
        Ok(event)
    }

    /// Decode a Kafka record body. Enveloped payloads are preferred; a bare
    /// payload is accepted and wrapped in a fresh envelope.
    pub fn decode(
        event_type: EventType,
        bytes: &[u8],
    ) -> Result<EventEnvelope<MessageEvent>, SchemaError> {
        if let Ok(mut envelope) =
            serde_json::from_slice::<EventEnvelope<serde_json::Value>>(bytes)
        {
            let data = Self::from_payload(event_type, envelope.data.take())?;
            return Ok(envelope.map(|_| data));
        }

        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let data = Self::from_payload(event_type, value)?;
        Ok(EventEnvelope::new("unknown", data))
    }
}
