//! Error types for the transactional outbox library.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Event not found in outbox, or no longer pending
    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    /// Failed to publish event to message broker
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Event type has no topic mapping
    #[error("Unroutable event type: {0}")]
    UnroutableEvent(String),

    /// Status column held a value this version does not know
    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

impl OutboxError {
    /// Broker and connection failures clear up on their own; routing and
    /// decoding problems do not.
    pub fn is_transient(&self) -> bool {
        match self {
            OutboxError::DatabaseError(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            OutboxError::PublishFailed(_) | OutboxError::Other(_) => true,
            _ => false,
        }
    }
}
