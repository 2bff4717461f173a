use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppResult;
use crate::repository::messages::MessageStore;

/// Per-conversation sequence numbers.
#[async_trait]
pub trait Sequencer: Send + Sync {
    /// Atomically increment and return the next seq.
    async fn next(&self, conversation_id: Uuid) -> AppResult<i64>;

    /// Last issued seq, without incrementing.
    async fn current(&self, conversation_id: Uuid) -> AppResult<i64>;
}

pub fn seq_key(conversation_id: Uuid) -> String {
    format!("im:seq:conv:{}", conversation_id)
}

pub fn warm_key(conversation_id: Uuid) -> String {
    format!("im:seq:warm:{}", conversation_id)
}

/// INCR only while the counter exists and was reconciled recently.
/// Returns -1 when reconciliation is needed.
static INCR_IF_WARM: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 1 and redis.call('EXISTS', KEYS[2]) == 1 then
            return redis.call('INCR', KEYS[1])
        end
        return -1
        "#,
    )
});

/// Raise the counter to at least ARGV[1], mark it warm for ARGV[2] seconds, then INCR.
static RECONCILE_AND_INCR: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local current = tonumber(redis.call('GET', KEYS[1]) or '0')
        local floor = tonumber(ARGV[1])
        if current < floor then
            redis.call('SET', KEYS[1], floor)
        end
        redis.call('SET', KEYS[2], '1', 'EX', ARGV[2])
        return redis.call('INCR', KEYS[1])
        "#,
    )
});

/// Redis counter, reconciled against the message store whenever it is
/// missing or its warm marker expired.
///
/// A Redis failure is returned as a retryable error; no seq is ever issued
/// without going through the atomic increment.
pub struct RedisSequencer {
    redis: ConnectionManager,
    store: Arc<dyn MessageStore>,
    warm_ttl: Duration,
}

impl RedisSequencer {
    pub fn new(redis: ConnectionManager, store: Arc<dyn MessageStore>, warm_ttl: Duration) -> Self {
        Self {
            redis,
            store,
            warm_ttl,
        }
    }
}

#[async_trait]
impl Sequencer for RedisSequencer {
    async fn next(&self, conversation_id: Uuid) -> AppResult<i64> {
        let mut conn = self.redis.clone();
        let counter = seq_key(conversation_id);
        let warm = warm_key(conversation_id);

        let seq: i64 = INCR_IF_WARM
            .key(&counter)
            .key(&warm)
            .invoke_async(&mut conn)
            .await?;
        if seq > 0 {
            return Ok(seq);
        }

        let floor = self.store.max_seq(conversation_id).await?;
        let seq: i64 = RECONCILE_AND_INCR
            .key(&counter)
            .key(&warm)
            .arg(floor)
            .arg(self.warm_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        info!(
            conversation_id = %conversation_id,
            floor,
            seq,
            "Sequence counter reconciled with message store"
        );
        Ok(seq)
    }

    async fn current(&self, conversation_id: Uuid) -> AppResult<i64> {
        let mut conn = self.redis.clone();
        let value: Option<i64> = conn.get(seq_key(conversation_id)).await?;
        match value {
            Some(seq) => Ok(seq),
            None => {
                debug!(conversation_id = %conversation_id, "Counter absent, reading store");
                self.store.max_seq(conversation_id).await
            }
        }
    }
}
