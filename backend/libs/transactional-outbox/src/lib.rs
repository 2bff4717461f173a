//! # Transactional Outbox
//!
//! Domain events are written to the `outbox_events` table inside the same
//! database transaction as the state change they describe, then published to
//! Kafka asynchronously by [`OutboxProcessor`] workers.
//!
//! This gives **at-least-once** publication:
//! - a crash after commit but before publish leaves the row `pending`, and the
//!   next poll publishes it;
//! - a row is never published for a transaction that rolled back, because the
//!   row rolled back with it.
//!
//! ## Row lifecycle
//!
//! ```text
//! pending ──claim (lease)──► publish ok ──► published ──(retention)──► deleted
//!    ▲                          │
//!    └── retry_count+1, backoff ┘ publish error
//!                               │ retry_count >= max_retries
//!                               ▼
//!                             failed (terminal, manual replay only)
//! ```
//!
//! Several workers may poll the same table. A worker only publishes rows it
//! claimed: claiming is a conditional `UPDATE … FOR UPDATE SKIP LOCKED` that sets
//! `locked_until`, so two workers never hold the same row at once. If a worker
//! dies while holding a claim, the lease expires and another worker picks the
//! row up.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEvent, OutboxRepository, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//!
//! async fn revoke(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxRepository,
//!     message_id: Uuid,
//!     conversation_id: Uuid,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("UPDATE messages SET status = 0 WHERE id = $1")
//!         .bind(message_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let event = OutboxEvent::new(
//!         "message.revoked",
//!         message_id,
//!         conversation_id,
//!         Some(message_id),
//!         serde_json::json!({ "message_id": message_id }),
//!     );
//!     outbox.insert(&mut tx, &event).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

mod error;
pub mod metrics;
mod processor;
mod publisher;

pub use error::{OutboxError, OutboxResult};
pub use processor::{BatchReport, OutboxProcessor, OutboxProcessorConfig};
pub use publisher::{KafkaOutboxPublisher, OutboxPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// An event staged in the outbox table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier, reused as the envelope `event_id` so consumers can dedupe
    pub id: Uuid,

    /// Event type name (e.g. "message.sent")
    pub event_type: String,

    /// Entity the event is about
    pub aggregate_id: Uuid,

    /// Kafka partition key; keeps one conversation's events in order
    pub conversation_id: Uuid,

    pub message_id: Option<Uuid>,

    /// Event payload as JSON
    pub payload: serde_json::Value,

    /// Optional metadata (correlation_id, source)
    pub metadata: Option<serde_json::Value>,

    pub status: OutboxStatus,

    /// Number of failed publish attempts
    pub retry_count: i32,

    /// Last error message from a failed publish attempt
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: Uuid,
        conversation_id: Uuid,
        message_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id,
            conversation_id,
            message_id,
            payload,
            metadata: None,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            published_at: None,
        }
    }

    /// Use a caller-derived id, so restaging the same fact is a no-op.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        let mut metadata = self
            .metadata
            .take()
            .unwrap_or_else(|| serde_json::json!({}));
        metadata["correlation_id"] = serde_json::json!(correlation_id.to_string());
        self.metadata = Some(metadata);
        self
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("correlation_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Storage operations needed by writers and by the publisher workers.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Stage an event inside the caller's transaction.
    ///
    /// Must be called on the same transaction that writes the business row,
    /// otherwise the outbox guarantee does not hold. Returns `false` when a
    /// row with the same id is already staged.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<bool>;

    /// Claim up to `limit` pending rows whose lease has expired, oldest first.
    ///
    /// Claimed rows stay `pending` but are invisible to other workers until
    /// `lease` elapses.
    async fn claim_pending(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEvent>>;

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()>;

    /// Record a failed attempt.
    ///
    /// Increments `retry_count`; the row becomes `failed` once it reaches
    /// `max_retries`, otherwise it stays pending and is not claimable again
    /// until `retry_after` has passed. Returns the resulting status.
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        max_retries: i32,
        retry_after: Duration,
    ) -> OutboxResult<OutboxStatus>;

    /// Delete published rows older than `before`. Returns rows removed.
    async fn delete_published_before(&self, before: DateTime<Utc>) -> OutboxResult<u64>;

    /// Pending count and oldest pending age (seconds). Age is 0 when nothing is pending.
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// PostgreSQL implementation of [`OutboxRepository`].
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

const EVENT_COLUMNS: &str = "id, event_type, aggregate_id, conversation_id, message_id, payload, \
     metadata, status, retry_count, last_error, created_at, published_at";

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = OutboxStatus::from_str(&status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        conversation_id: row.try_get("conversation_id")?,
        message_id: row.try_get("message_id")?,
        payload: row.try_get("payload")?,
        metadata: row.try_get("metadata")?,
        status,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
    })
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Reset every row created at or after `ts` back to pending.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                published_at = NULL,
                locked_until = NULL,
                retry_count = 0,
                last_error = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("Failed to replay events since timestamp")?;

        Ok(res.rows_affected())
    }

    /// Give terminally failed rows a fresh retry budget.
    pub async fn replay_failed(&self) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                locked_until = NULL,
                retry_count = 0
            WHERE status = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to replay failed events")?;

        Ok(res.rows_affected())
    }

    pub async fn list_failed(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE status = 'failed' ORDER BY created_at ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch failed events")?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse events")?;
        Ok(events)
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                event_type,
                aggregate_id,
                conversation_id,
                message_id,
                payload,
                metadata,
                status,
                retry_count,
                last_error,
                created_at,
                published_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(event.aggregate_id)
        .bind(event.conversation_id)
        .bind(event.message_id)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(event.status.as_str())
        .bind(event.retry_count)
        .bind(&event.last_error)
        .bind(event.created_at)
        .bind(event.published_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event into outbox")?;

        if res.rows_affected() == 0 {
            debug!(event_id = %event.id, "Event already staged");
            return Ok(false);
        }

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            conversation_id = %event.conversation_id,
            "Event staged in outbox"
        );

        Ok(true)
    }

    async fn claim_pending(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEvent>> {
        let sql = format!(
            r#"
            UPDATE outbox_events
            SET locked_until = NOW() + ($2::BIGINT * INTERVAL '1 millisecond')
            WHERE id IN (
                SELECT id
                FROM outbox_events
                WHERE status = 'pending'
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(millis(lease))
            .fetch_all(&self.pool)
            .await
            .context("Failed to claim pending events")?;

        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse events")?;
        // RETURNING does not preserve the subquery order
        events.sort_by_key(|e| e.created_at);

        debug!(count = events.len(), "Claimed pending outbox events");

        Ok(events)
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published',
                published_at = NOW(),
                locked_until = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as published")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not pending when marking as published");
            return Err(OutboxError::EventNotFound(event_id));
        }

        debug!(event_id = %event_id, "Event marked as published");

        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        max_retries: i32,
        retry_after: Duration,
    ) -> OutboxResult<OutboxStatus> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                last_error = $2,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'failed' ELSE 'pending' END,
                locked_until = NOW() + ($4::BIGINT * INTERVAL '1 millisecond')
            WHERE id = $1 AND status = 'pending'
            RETURNING status
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(max_retries)
        .bind(millis(retry_after))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark event as failed")?;

        let Some(row) = row else {
            warn!(event_id = %event_id, "Event not pending when marking as failed");
            return Err(OutboxError::EventNotFound(event_id));
        };

        let status: String = row.try_get("status")?;
        OutboxStatus::from_str(&status)
    }

    async fn delete_published_before(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE status = 'published' AND published_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .context("Failed to delete published events")?;

        Ok(res.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!(matches!(
            "publishing".parse::<OutboxStatus>(),
            Err(OutboxError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_new_event_is_pending() {
        let message_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let event = OutboxEvent::new(
            "message.sent",
            message_id,
            conversation_id,
            Some(message_id),
            serde_json::json!({}),
        );

        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert!(event.published_at.is_none());
        assert!(event.correlation_id().is_none());
    }

    #[test]
    fn test_correlation_id_in_metadata() {
        let cid = Uuid::new_v4();
        let event = OutboxEvent::new(
            "message.read",
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            serde_json::json!({}),
        )
        .with_correlation_id(cid);

        assert_eq!(event.correlation_id(), Some(cid));
    }

    #[test]
    fn test_with_id_overrides_random_id() {
        let id = Uuid::new_v4();
        let event = OutboxEvent::new(
            "message.read",
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            serde_json::json!({}),
        )
        .with_id(id);

        assert_eq!(event.id, id);
        assert_eq!(event.status, OutboxStatus::Pending);
    }
}
