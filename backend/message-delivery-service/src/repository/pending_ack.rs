use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::PendingAckItem;

/// Pushes awaiting a client acknowledgment.
#[async_trait]
pub trait PendingAckStore: Send + Sync {
    async fn register(&self, item: &PendingAckItem) -> AppResult<()>;

    /// Returns false when the item was unknown (already acked, failed or expired).
    async fn remove(&self, user_id: Uuid, message_id: Uuid) -> AppResult<bool>;

    /// Returns how many of `message_ids` were still pending.
    async fn remove_batch(&self, user_id: Uuid, message_ids: &[Uuid]) -> AppResult<usize>;

    /// Outstanding items for a user, oldest send first.
    async fn pending(&self, user_id: Uuid) -> AppResult<Vec<PendingAckItem>>;

    async fn count(&self, user_id: Uuid) -> AppResult<usize>;

    /// Atomically claim up to `limit` items last sent at or before `cutoff_ms`.
    ///
    /// Items below `max_retry` get `retry_count + 1` and `sent_at = now_ms` and
    /// come back as `Pending`; the caller resends them. Items at `max_retry`
    /// come back as `Failed` and leave the due index for good. A claimed item
    /// is not visible to another claimer until it is due again.
    async fn claim_due(
        &self,
        cutoff_ms: i64,
        now_ms: i64,
        limit: usize,
        max_retry: i32,
    ) -> AppResult<Vec<PendingAckItem>>;
}

const USER_PREFIX: &str = "pending_ack:";
const ITEM_PREFIX: &str = "pending_ack_item:";
const DUE_KEY: &str = "pending_ack:due";

pub fn user_key(user_id: Uuid) -> String {
    format!("{USER_PREFIX}{user_id}")
}

pub fn item_key(user_id: Uuid, message_id: Uuid) -> String {
    format!("{ITEM_PREFIX}{user_id}:{message_id}")
}

fn due_member(user_id: Uuid, message_id: Uuid) -> String {
    format!("{user_id}:{message_id}")
}

// KEYS: due index. ARGV: cutoff, now, limit, max_retry, item_ttl, item prefix, user prefix
static CLAIM_DUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
        local claimed = {}
        for _, member in ipairs(entries) do
            local sep = string.find(member, ':', 1, true)
            local uid = string.sub(member, 1, sep - 1)
            local mid = string.sub(member, sep + 1)
            local item_key = ARGV[6] .. uid .. ':' .. mid
            local user_key = ARGV[7] .. uid
            local raw = redis.call('GET', item_key)
            if not raw then
                redis.call('ZREM', KEYS[1], member)
                redis.call('ZREM', user_key, mid)
            else
                local item = cjson.decode(raw)
                if tonumber(item.retry_count) >= tonumber(ARGV[4]) then
                    item.status = 'failed'
                    redis.call('SET', item_key, cjson.encode(item), 'EX', ARGV[5])
                    redis.call('ZREM', KEYS[1], member)
                    redis.call('ZREM', user_key, mid)
                else
                    item.retry_count = tonumber(item.retry_count) + 1
                    item.sent_at = tonumber(ARGV[2])
                    redis.call('SET', item_key, cjson.encode(item), 'EX', ARGV[5])
                    redis.call('ZADD', KEYS[1], ARGV[2], member)
                    redis.call('ZADD', user_key, ARGV[2], mid)
                end
                table.insert(claimed, cjson.encode(item))
            end
        end
        return claimed
        "#,
    )
});

/// Redis layout:
/// - `pending_ack:{uid}` ZSET of message ids scored by `sent_at`
/// - `pending_ack_item:{uid}:{mid}` item JSON, expires after `item_ttl`
/// - `pending_ack:due` ZSET of `{uid}:{mid}` across all users, scored by `sent_at`
pub struct RedisPendingAck {
    redis: ConnectionManager,
    item_ttl: Duration,
}

impl RedisPendingAck {
    pub fn new(redis: ConnectionManager, item_ttl: Duration) -> Self {
        Self { redis, item_ttl }
    }

    fn decode(raw: &str) -> Option<PendingAckItem> {
        match serde_json::from_str(raw) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(error = %e, "Skipping corrupt pending-ack item");
                None
            }
        }
    }
}

#[async_trait]
impl PendingAckStore for RedisPendingAck {
    async fn register(&self, item: &PendingAckItem) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(item)?;

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(item_key(item.user_id, item.message_id))
            .arg(json)
            .arg("EX")
            .arg(self.item_ttl.as_secs())
            .ignore()
            .cmd("ZADD")
            .arg(user_key(item.user_id))
            .arg(item.sent_at)
            .arg(item.message_id.to_string())
            .ignore()
            .cmd("ZADD")
            .arg(DUE_KEY)
            .arg(item.sent_at)
            .arg(due_member(item.user_id, item.message_id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, user_id: Uuid, message_id: Uuid) -> AppResult<bool> {
        Ok(self.remove_batch(user_id, &[message_id]).await? > 0)
    }

    async fn remove_batch(&self, user_id: Uuid, message_ids: &[Uuid]) -> AppResult<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for mid in message_ids {
            pipe.cmd("ZREM").arg(user_key(user_id)).arg(mid.to_string());
            pipe.cmd("ZREM")
                .arg(DUE_KEY)
                .arg(due_member(user_id, *mid))
                .ignore();
            pipe.cmd("DEL").arg(item_key(user_id, *mid)).ignore();
        }
        let removed: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(removed.into_iter().filter(|n| *n > 0).count())
    }

    async fn pending(&self, user_id: Uuid) -> AppResult<Vec<PendingAckItem>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(user_key(user_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|mid| format!("{ITEM_PREFIX}{user_id}:{mid}"))
            .collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .iter()
            .flatten()
            .filter_map(|r| Self::decode(r))
            .collect())
    }

    async fn count(&self, user_id: Uuid) -> AppResult<usize> {
        let mut conn = self.redis.clone();
        let count: usize = redis::cmd("ZCARD")
            .arg(user_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn claim_due(
        &self,
        cutoff_ms: i64,
        now_ms: i64,
        limit: usize,
        max_retry: i32,
    ) -> AppResult<Vec<PendingAckItem>> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = CLAIM_DUE
            .key(DUE_KEY)
            .arg(cutoff_ms)
            .arg(now_ms)
            .arg(limit)
            .arg(max_retry)
            .arg(self.item_ttl.as_secs())
            .arg(ITEM_PREFIX)
            .arg(USER_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(raw.iter().filter_map(|r| Self::decode(r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let uid = Uuid::nil();
        let mid = Uuid::from_u128(1);
        assert_eq!(user_key(uid), format!("pending_ack:{uid}"));
        assert_eq!(item_key(uid, mid), format!("pending_ack_item:{uid}:{mid}"));
        assert_eq!(due_member(uid, mid), format!("{uid}:{mid}"));
    }
}
