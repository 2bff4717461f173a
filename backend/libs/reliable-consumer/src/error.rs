//! Error types for the reliable consumer library

use thiserror::Error;

/// Result type for consumer plumbing
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised by the consumer itself (not by event handlers)
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Kafka client failure (create, subscribe, produce, commit)
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Producing a retry or dead-letter record failed
    #[error("Failed to route record to {topic}: {reason}")]
    RoutingFailed { topic: String, reason: String },

    /// JSON serialization/deserialization error for envelopes
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Failure reported by an [`crate::EventHandler`].
///
/// The classification decides routing: retryable failures go through the
/// retry topic with backoff, permanent ones go straight to the dead-letter topic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        HandlerError::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        HandlerError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    /// Message without the classification prefix
    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(m) | HandlerError::Permanent(m) => m,
        }
    }
}
