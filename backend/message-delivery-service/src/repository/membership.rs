use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Conversation membership, owned by another service.
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// Current members. Any failure must surface as
    /// [`AppError::MembershipUnavailable`]; callers fail closed.
    async fn list_member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>>;
}

/// Reads the `conversation_members` table.
pub struct PgMembership {
    pool: PgPool,
}

impl PgMembership {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipClient for PgMembership {
    async fn list_member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        sqlx::query_scalar(
            r#"
            SELECT user_id
            FROM conversation_members
            WHERE conversation_id = $1 AND left_at IS NULL
            ORDER BY joined_at
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::MembershipUnavailable(e.to_string()))
    }
}
