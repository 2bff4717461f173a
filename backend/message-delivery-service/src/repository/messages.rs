use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use transactional_outbox::{OutboxEvent, OutboxRepository, SqlxOutboxRepository};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{ContentType, Message, MessageStatus};

const IDEMPOTENCY_CONSTRAINT: &str = "messages_sender_client_msg_key";
const SEQ_CONSTRAINT: &str = "messages_conversation_seq_key";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, client_msg_id, seq, content_type, \
     content, status, reply_to_id, created_at, updated_at";

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created,
    /// Same (sender, client_msg_id) was already committed; carries the winner
    Duplicate(Message),
}

/// Durable message storage. The authoritative source for history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert the message and stage `event` in the same transaction.
    async fn create_with_event(&self, msg: &Message, event: &OutboxEvent)
        -> AppResult<CreateOutcome>;

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>>;

    async fn get_by_idempotency_key(
        &self,
        sender_id: Uuid,
        client_msg_id: &str,
    ) -> AppResult<Option<Message>>;

    /// Messages with seq > `after_seq`, ascending. Hidden messages are included
    /// only when `include_hidden` is set.
    async fn history_after(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
        limit: i64,
        include_hidden: bool,
    ) -> AppResult<Vec<Message>>;

    /// Visible messages with seq < `before_seq`, closest first in the query,
    /// returned ascending.
    async fn history_before(
        &self,
        conversation_id: Uuid,
        before_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    /// Status transition, with an optional event staged in the same transaction.
    async fn update_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        event: Option<&OutboxEvent>,
    ) -> AppResult<Message>;

    /// Stage an event that has no accompanying message write. Returns
    /// `false` when an event with the same id was already staged.
    async fn stage_event(&self, event: &OutboxEvent) -> AppResult<bool>;

    /// Highest committed seq, 0 for an empty conversation.
    async fn max_seq(&self, conversation_id: Uuid) -> AppResult<i64>;

    /// Newest `limit` messages of any status, ascending.
    async fn latest(&self, conversation_id: Uuid, limit: i64) -> AppResult<Vec<Message>>;
}

pub struct PgMessageStore {
    pool: PgPool,
    outbox: SqlxOutboxRepository,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: SqlxOutboxRepository::new(pool.clone()),
            pool,
        }
    }
}

fn message_from_row(row: &PgRow) -> AppResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        client_msg_id: row.try_get("client_msg_id")?,
        seq: row.try_get("seq")?,
        content_type: ContentType::try_from(row.try_get::<i16, _>("content_type")?)
            .map_err(|e| AppError::Internal(e.to_string()))?,
        content: row.try_get("content")?,
        status: MessageStatus::try_from(row.try_get::<i16, _>("status")?)?,
        reply_to_id: row.try_get("reply_to_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn violated_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            db.constraint().map(str::to_string)
        }
        _ => None,
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_with_event(
        &self,
        msg: &Message,
        event: &OutboxEvent,
    ) -> AppResult<CreateOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (
                id, conversation_id, sender_id, client_msg_id, seq,
                content_type, content, status, reply_to_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(msg.id)
        .bind(msg.conversation_id)
        .bind(msg.sender_id)
        .bind(&msg.client_msg_id)
        .bind(msg.seq)
        .bind(i16::from(msg.content_type))
        .bind(&msg.content)
        .bind(i16::from(msg.status))
        .bind(msg.reply_to_id)
        .bind(msg.created_at)
        .bind(msg.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            tx.rollback().await?;
            return match violated_constraint(&err).as_deref() {
                Some(IDEMPOTENCY_CONSTRAINT) => {
                    debug!(
                        sender_id = %msg.sender_id,
                        client_msg_id = %msg.client_msg_id,
                        "Lost idempotency race, returning committed message"
                    );
                    self.get_by_idempotency_key(msg.sender_id, &msg.client_msg_id)
                        .await?
                        .map(CreateOutcome::Duplicate)
                        .ok_or_else(|| AppError::Internal("duplicate key but no row".into()))
                }
                Some(SEQ_CONSTRAINT) => {
                    warn!(
                        conversation_id = %msg.conversation_id,
                        seq = msg.seq,
                        "Sequencer issued an already committed seq"
                    );
                    Err(AppError::SeqConflict {
                        conversation_id: msg.conversation_id,
                        seq: msg.seq,
                    })
                }
                _ => Err(err.into()),
            };
        }

        self.outbox.insert(&mut tx, event).await?;
        tx.commit().await?;

        Ok(CreateOutcome::Created)
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_by_idempotency_key(
        &self,
        sender_id: Uuid,
        client_msg_id: &str,
    ) -> AppResult<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = $1 AND client_msg_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(sender_id)
            .bind(client_msg_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn history_after(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
        limit: i64,
        include_hidden: bool,
    ) -> AppResult<Vec<Message>> {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
              AND seq > $2
              AND ($4 OR status = $5)
            ORDER BY seq ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(after_seq)
            .bind(limit)
            .bind(include_hidden)
            .bind(i16::from(MessageStatus::Normal))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn history_before(
        &self,
        conversation_id: Uuid,
        before_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
              AND seq < $2
              AND status = $4
            ORDER BY seq DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(before_seq)
            .bind(limit)
            .bind(i16::from(MessageStatus::Normal))
            .fetch_all(&self.pool)
            .await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn update_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        event: Option<&OutboxEvent>,
    ) -> AppResult<Message> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE messages
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(message_id)
            .bind(i16::from(status))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound)?;
        let message = message_from_row(&row)?;

        if let Some(event) = event {
            self.outbox.insert(&mut tx, event).await?;
        }
        tx.commit().await?;

        Ok(message)
    }

    async fn stage_event(&self, event: &OutboxEvent) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let staged = self.outbox.insert(&mut tx, event).await?;
        tx.commit().await?;
        Ok(staged)
    }

    async fn max_seq(&self, conversation_id: Uuid) -> AppResult<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM messages WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    async fn latest(&self, conversation_id: Uuid, limit: i64) -> AppResult<Vec<Message>> {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
            ORDER BY seq DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}
