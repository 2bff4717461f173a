use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::Message;

/// Bounded, seq-ordered window of recent messages per conversation.
///
/// Never authoritative: every entry can be rebuilt from the message store,
/// and readers fall back to the store when the window does not cover a range.
#[async_trait]
pub trait TimelineCache: Send + Sync {
    /// Add (or overwrite) the entry at `msg.seq` and evict beyond the window.
    async fn append(&self, msg: &Message) -> AppResult<()>;

    /// Cached messages with seq > `after_seq`, ascending, any status.
    async fn after(&self, conversation_id: Uuid, after_seq: i64, limit: usize)
        -> AppResult<Vec<Message>>;

    /// Cached messages with seq < `before_seq`, ascending, any status.
    async fn before(
        &self,
        conversation_id: Uuid,
        before_seq: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>>;

    /// Update an entry in place. Entries outside the window are left alone.
    async fn replace(&self, msg: &Message) -> AppResult<bool>;

    /// Lowest cached seq, `None` when nothing is cached.
    async fn floor_seq(&self, conversation_id: Uuid) -> AppResult<Option<i64>>;

    /// Replace the whole window with `messages`.
    async fn rebuild(&self, conversation_id: Uuid, messages: &[Message]) -> AppResult<()>;

    /// Drop the window so the next read rebuilds it from the store.
    async fn invalidate(&self, conversation_id: Uuid) -> AppResult<()>;
}

pub fn timeline_key(conversation_id: Uuid) -> String {
    format!("im:timeline:conv:{}", conversation_id)
}

/// Whether a cached `after` slice can answer a read on its own: it must
/// reach the highest issued seq, or hold at least `limit` visible entries.
pub fn serves_after(cached: &[Message], after_seq: i64, limit: usize, head_seq: i64) -> bool {
    let visible = cached.iter().filter(|m| m.is_visible()).count();
    if visible >= limit && limit > 0 {
        return true;
    }
    let top = cached.last().map(|m| m.seq).unwrap_or(after_seq);
    top >= head_seq
}

/// The newest `window` entries of an ascending slice.
pub fn window_tail(messages: &[Message], window: usize) -> &[Message] {
    &messages[messages.len().saturating_sub(window)..]
}

/// ZREMRANGEBYRANK stop index that keeps only the top `window` members.
fn evict_stop(window: usize) -> i64 {
    -(window as i64) - 1
}

/// Replace the member at score ARGV[1] only if one exists.
static REPLACE_IN_PLACE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local removed = redis.call('ZREMRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1])
        if removed == 0 then
            return 0
        end
        redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
        return 1
        "#,
    )
});

pub struct RedisTimeline {
    redis: ConnectionManager,
    window: usize,
    ttl: Duration,
}

impl RedisTimeline {
    pub fn new(redis: ConnectionManager, window: usize, ttl: Duration) -> Self {
        Self { redis, window, ttl }
    }

    fn decode(raw: Vec<String>) -> Vec<Message> {
        raw.into_iter()
            .filter_map(|entry| match serde_json::from_str::<Message>(&entry) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable timeline entry");
                    None
                }
            })
            .collect()
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs() as i64
    }
}

#[async_trait]
impl TimelineCache for RedisTimeline {
    async fn append(&self, msg: &Message) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let key = timeline_key(msg.conversation_id);
        let member = serde_json::to_string(msg)?;

        redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(msg.seq)
            .arg(msg.seq)
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(msg.seq)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(&key)
            .arg(0)
            .arg(evict_stop(self.window))
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn after(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(timeline_key(conversation_id))
            .arg(format!("({}", after_seq))
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(Self::decode(raw))
    }

    async fn before(
        &self,
        conversation_id: Uuid,
        before_seq: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(timeline_key(conversation_id))
            .arg(format!("({}", before_seq))
            .arg("-inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        let mut messages = Self::decode(raw);
        messages.reverse();
        Ok(messages)
    }

    async fn replace(&self, msg: &Message) -> AppResult<bool> {
        let mut conn = self.redis.clone();
        let member = serde_json::to_string(msg)?;
        let replaced: i64 = REPLACE_IN_PLACE
            .key(timeline_key(msg.conversation_id))
            .arg(msg.seq)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(replaced == 1)
    }

    async fn floor_seq(&self, conversation_id: Uuid) -> AppResult<Option<i64>> {
        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(timeline_key(conversation_id))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries.first().map(|(_, score)| *score as i64))
    }

    async fn rebuild(&self, conversation_id: Uuid, messages: &[Message]) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let key = timeline_key(conversation_id);

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(&key).ignore();
        let tail = window_tail(messages, self.window);
        for msg in tail {
            pipe.cmd("ZADD")
                .arg(&key)
                .arg(msg.seq)
                .arg(serde_json::to_string(msg)?)
                .ignore();
        }
        if !tail.is_empty() {
            pipe.cmd("EXPIRE").arg(&key).arg(self.ttl_secs()).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn invalidate(&self, conversation_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(timeline_key(conversation_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
