use chrono::{DateTime, Utc};
/// Event schemas for the message ordering and delivery pipeline.
///
/// Every Kafka record produced by the outbox publisher carries an
/// [`EventEnvelope`] whose `data` is the payload of one [`MessageEvent`] variant.
/// Consumers resolve the variant from the topic (or the `event_type` header)
/// and decode exhaustively, so adding a variant is a compile-time change
/// everywhere the enum is matched.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;
pub mod topics;

pub use events::{EventType, MessageEvent, MessageRead, MessageRevoked, MessageSent, SchemaError};

/// Current schema version for all events
pub const SCHEMA_VERSION: u32 = 1;

/// Base event envelope for all Kafka messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event ID for idempotency and tracing (the outbox row id)
    pub event_id: Uuid,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Schema version for compatibility checking
    pub schema_version: u32,
    /// Source service that generated the event
    pub source: String,
    /// Correlation ID for distributed tracing
    pub correlation_id: Option<Uuid>,
    /// Actual event payload
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(source: impl Into<String>, data: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            correlation_id: None,
            data,
        }
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EventEnvelope<U> {
        EventEnvelope {
            event_id: self.event_id,
            timestamp: self.timestamp,
            schema_version: self.schema_version,
            source: self.source,
            correlation_id: self.correlation_id,
            data: f(self.data),
        }
    }
}

pub fn is_compatible(current_version: u32, message_version: u32) -> bool {
    // Exact match until a second schema version exists
    current_version == message_version
}
