use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub type AppResult<T> = Result<T, AppError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("user {user_id} is not a member of conversation {conversation_id}")]
    NotMember { user_id: Uuid, conversation_id: Uuid },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("message already revoked or deleted")]
    InvalidState,

    #[error("revoke window expired (created_at: {created_at}, max_revoke_seconds: {max_revoke_seconds})")]
    RevokeWindowExpired {
        created_at: DateTime<Utc>,
        max_revoke_seconds: i64,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("event bus error: {0}")]
    EventBus(String),

    #[error("membership service unavailable: {0}")]
    MembershipUnavailable(String),

    /// The sequencer handed out a seq that is already committed
    #[error("seq {seq} already used in conversation {conversation_id}")]
    SeqConflict { conversation_id: Uuid, seq: i64 },

    #[error("push failed: {0}")]
    Push(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Serialization(e.to_string())
    }
}

impl From<transactional_outbox::OutboxError> for AppError {
    fn from(e: transactional_outbox::OutboxError) -> Self {
        match e {
            transactional_outbox::OutboxError::DatabaseError(db) => AppError::Database(db.to_string()),
            transactional_outbox::OutboxError::SerializationError(s) => {
                AppError::Serialization(s.to_string())
            }
            transactional_outbox::OutboxError::PublishFailed(msg) => AppError::EventBus(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::EventBus(_)
            | AppError::MembershipUnavailable(_)
            | AppError::SeqConflict { .. }
            | AppError::Push(_) => ErrorKind::Retryable,
            // Internal covers corrupt stored data, which does not heal on retry
            _ => ErrorKind::Permanent,
        }
    }

    /// Returns whether the caller (or a background worker) may retry
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Rejections caused by the request itself
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::BadRequest(_)
                | AppError::NotMember { .. }
                | AppError::Forbidden(_)
                | AppError::InvalidState
                | AppError::RevokeWindowExpired { .. }
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotMember { .. } | AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::InvalidState | AppError::SeqConflict { .. } => StatusCode::CONFLICT,
            AppError::RevokeWindowExpired { .. } => StatusCode::GONE,
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::EventBus(_)
            | AppError::MembershipUnavailable(_)
            | AppError::Push(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        // infra detail stays in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            status.canonical_reason().unwrap_or("error").to_string()
        } else {
            self.to_string()
        };
        HttpResponse::build(status).json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
            "retryable": self.is_retryable(),
        }))
    }
}
