use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{OfflineEntry, OfflineStatus, PendingMessage};

/// Frames kept for recipients who could not be reached live.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Idempotent per (user, message). Returns false when already stored.
    async fn save(&self, entry: &OfflineEntry) -> AppResult<bool>;

    /// Pending entries for a user, per-conversation seq order.
    async fn pending(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<PendingMessage>>;

    /// Returns false when the entry was no longer pending.
    async fn mark_delivered(&self, id: i64) -> AppResult<bool>;

    /// Count a failed replay; the entry turns `Failed` at `max_attempts`.
    async fn incr_retry(&self, id: i64, max_attempts: i32) -> AppResult<OfflineStatus>;

    async fn delete_delivered_before(&self, before: DateTime<Utc>) -> AppResult<u64>;
}

pub struct PgOfflineStore {
    pool: PgPool,
}

impl PgOfflineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn pending_from_row(row: &PgRow) -> AppResult<PendingMessage> {
    Ok(PendingMessage {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        message_id: row.try_get("message_id")?,
        conversation_id: row.try_get("conversation_id")?,
        seq: row.try_get("seq")?,
        payload: row.try_get("payload")?,
        status: OfflineStatus::try_from(row.try_get::<i16, _>("status")?)?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

#[async_trait]
impl OfflineStore for PgOfflineStore {
    async fn save(&self, entry: &OfflineEntry) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO pending_messages (user_id, message_id, conversation_id, seq, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, message_id) DO NOTHING
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.message_id)
        .bind(entry.conversation_id)
        .bind(entry.seq)
        .bind(&entry.payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<PendingMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, message_id, conversation_id, seq, payload,
                   status, retry_count, created_at, delivered_at
            FROM pending_messages
            WHERE user_id = $1 AND status = $2
            ORDER BY conversation_id, seq
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(i16::from(OfflineStatus::Pending))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    async fn mark_delivered(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_messages
            SET status = $2, delivered_at = NOW()
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(id)
        .bind(i16::from(OfflineStatus::Delivered))
        .bind(i16::from(OfflineStatus::Pending))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn incr_retry(&self, id: i64, max_attempts: i32) -> AppResult<OfflineStatus> {
        let status: i16 = sqlx::query_scalar(
            r#"
            UPDATE pending_messages
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= $2 THEN $3 ELSE status END
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(max_attempts)
        .bind(i16::from(OfflineStatus::Failed))
        .fetch_one(&self.pool)
        .await?;

        OfflineStatus::try_from(status)
    }

    async fn delete_delivered_before(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM pending_messages WHERE status = $1 AND delivered_at < $2",
        )
        .bind(i16::from(OfflineStatus::Delivered))
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
