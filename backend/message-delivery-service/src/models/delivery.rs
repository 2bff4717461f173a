use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Where one of a user's devices is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRoute {
    pub device_id: String,
    /// Instance holding the connection
    pub server_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_ping_at: DateTime<Utc>,
}

impl DeviceRoute {
    pub fn new(device_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            server_id: server_id.into(),
            connected_at: now,
            last_ping_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Pending,
    Failed,
}

/// A push that has not been acknowledged by the client yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAckItem {
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    /// Unix millis of the last (re)send
    pub sent_at: i64,
    pub retry_count: i32,
    pub status: AckStatus,
}

impl PendingAckItem {
    pub fn new(user_id: Uuid, message_id: Uuid, conversation_id: Uuid, seq: i64) -> Self {
        Self {
            user_id,
            message_id,
            conversation_id,
            seq,
            sent_at: Utc::now().timestamp_millis(),
            retry_count: 0,
            status: AckStatus::Pending,
        }
    }
}

/// Client acknowledgment of one pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckItem {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub seq: i64,
}

/// Frames a client sends on its realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Ack(AckItem),
    BatchAck { items: Vec<AckItem> },
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum OfflineStatus {
    Pending = 0,
    Delivered = 1,
    Failed = 2,
}

impl TryFrom<i16> for OfflineStatus {
    type Error = AppError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => OfflineStatus::Pending,
            1 => OfflineStatus::Delivered,
            2 => OfflineStatus::Failed,
            other => return Err(AppError::Internal(format!("unknown offline status {other}"))),
        })
    }
}

impl From<OfflineStatus> for i16 {
    fn from(value: OfflineStatus) -> Self {
        value as i16
    }
}

/// Frame persisted for a recipient who could not be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineEntry {
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: i64,
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    pub payload: String,
    pub status: OfflineStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

/// Realtime frame kinds sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    NewMessage,
    MessageRead,
    MessageRevoked,
    MessageResend,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::NewMessage => "new_message",
            FrameType::MessageRead => "message_read",
            FrameType::MessageRevoked => "message_revoked",
            FrameType::MessageResend => "message_resend",
        }
    }

    /// `{"type": ..., "data": ...}`
    pub fn encode(&self, data: serde_json::Value) -> String {
        serde_json::json!({ "type": self.as_str(), "data": data }).to_string()
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
