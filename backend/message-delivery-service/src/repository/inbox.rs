use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{InboxRecord, UnreadConversation};

/// Per-user read/delivery watermarks and unread counters.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Advance the delivered watermark to `seq`. The unread increment (or, for
    /// the sender, the read watermark) is applied in the same atomic step and
    /// only when `seq` is above the current delivered watermark, so replays
    /// are no-ops. Returns whether the record changed.
    async fn update_delivered(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        seq: i64,
        is_sender: bool,
        msg_time: i64,
    ) -> AppResult<bool>;

    /// Monotonic: ignored unless `read_seq` is above the current read watermark.
    async fn mark_read(&self, user_id: Uuid, conversation_id: Uuid, read_seq: i64)
        -> AppResult<bool>;

    async fn get(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<Option<InboxRecord>>;

    async fn all(&self, user_id: Uuid) -> AppResult<Vec<InboxRecord>>;

    async fn clear_unread(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<()>;

    async fn set_muted(&self, user_id: Uuid, conversation_id: Uuid, muted: bool) -> AppResult<()>;

    async fn set_pinned(&self, user_id: Uuid, conversation_id: Uuid, pinned: bool)
        -> AppResult<()>;

    /// Conversation ids ordered by last message time, newest first.
    async fn recent_conversations(&self, user_id: Uuid, limit: usize) -> AppResult<Vec<Uuid>>;

    /// Unread across conversations that are not muted.
    async fn total_unread(&self, user_id: Uuid) -> AppResult<i64> {
        Ok(self
            .all(user_id)
            .await?
            .iter()
            .filter(|r| !r.muted)
            .map(|r| r.unread_count)
            .sum())
    }

    async fn unread_conversations(&self, user_id: Uuid) -> AppResult<Vec<UnreadConversation>> {
        let mut unread: Vec<UnreadConversation> = self
            .all(user_id)
            .await?
            .iter()
            .filter(|r| r.unread_count > 0)
            .map(UnreadConversation::from)
            .collect();
        unread.sort_by(|a, b| b.last_msg_time.cmp(&a.last_msg_time));
        Ok(unread)
    }
}

pub fn inbox_key(user_id: Uuid) -> String {
    format!("im:inbox:user:{}", user_id)
}

pub fn conversation_list_key(user_id: Uuid) -> String {
    format!("im:convlist:user:{}", user_id)
}

const LOAD_RECORD: &str = r#"
local function load(key, conv)
    local raw = redis.call('HGET', key, conv)
    if raw then
        return cjson.decode(raw)
    end
    return {
        conversation_id = conv,
        last_read_seq = 0,
        last_delivered_seq = 0,
        unread_count = 0,
        muted = false,
        pinned = false,
        last_msg_seq = 0,
        last_msg_time = 0
    }
end
"#;

// KEYS: inbox hash, conversation list. ARGV: conversation, seq, is_sender, msg_time
//
// Known undercount: when two fan-outs for the same member land out of order
// (seq 5 before seq 4), the late one fails the watermark guard and its unread
// increment is dropped. The count self-corrects on the next mark_read, which
// recomputes unread from the watermarks.
static UPDATE_DELIVERED: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        r#"
        {LOAD_RECORD}
        local rec = load(KEYS[1], ARGV[1])
        local seq = tonumber(ARGV[2])
        if seq <= tonumber(rec.last_delivered_seq) then
            return 0
        end
        rec.last_delivered_seq = seq
        rec.last_msg_seq = seq
        rec.last_msg_time = tonumber(ARGV[4])
        if ARGV[3] == '1' then
            if seq > tonumber(rec.last_read_seq) then
                rec.last_read_seq = seq
            end
            rec.unread_count = 0
        else
            rec.unread_count = tonumber(rec.unread_count) + 1
        end
        redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(rec))
        redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
        return 1
        "#
    ))
});

// KEYS: inbox hash. ARGV: conversation, read_seq
static MARK_READ: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        r#"
        {LOAD_RECORD}
        local rec = load(KEYS[1], ARGV[1])
        local read = tonumber(ARGV[2])
        if read <= tonumber(rec.last_read_seq) then
            return 0
        end
        rec.last_read_seq = read
        if read > tonumber(rec.last_delivered_seq) then
            rec.last_delivered_seq = read
        end
        local unread = tonumber(rec.last_delivered_seq) - read
        if unread < 0 then
            unread = 0
        end
        rec.unread_count = unread
        redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(rec))
        return 1
        "#
    ))
});

// KEYS: inbox hash. ARGV: conversation, field, value ('1'/'0'), or field 'clear'
static SET_FIELD: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        r#"
        {LOAD_RECORD}
        local rec = load(KEYS[1], ARGV[1])
        if ARGV[2] == 'clear' then
            rec.last_read_seq = rec.last_delivered_seq
            rec.unread_count = 0
        else
            rec[ARGV[2]] = ARGV[3] == '1'
        end
        redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(rec))
        return 1
        "#
    ))
});

pub struct RedisInbox {
    redis: ConnectionManager,
}

impl RedisInbox {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    async fn set_field(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        field: &str,
        value: bool,
    ) -> AppResult<()> {
        let mut conn = self.redis.clone();
        SET_FIELD
            .key(inbox_key(user_id))
            .arg(conversation_id.to_string())
            .arg(field)
            .arg(if value { "1" } else { "0" })
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for RedisInbox {
    async fn update_delivered(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        seq: i64,
        is_sender: bool,
        msg_time: i64,
    ) -> AppResult<bool> {
        let mut conn = self.redis.clone();
        let changed: i64 = UPDATE_DELIVERED
            .key(inbox_key(user_id))
            .key(conversation_list_key(user_id))
            .arg(conversation_id.to_string())
            .arg(seq)
            .arg(if is_sender { "1" } else { "0" })
            .arg(msg_time)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn mark_read(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        read_seq: i64,
    ) -> AppResult<bool> {
        let mut conn = self.redis.clone();
        let changed: i64 = MARK_READ
            .key(inbox_key(user_id))
            .arg(conversation_id.to_string())
            .arg(read_seq)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }

    async fn get(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<Option<InboxRecord>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(inbox_key(user_id))
            .arg(conversation_id.to_string())
            .query_async(&mut conn)
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(Into::into))
            .transpose()
    }

    async fn all(&self, user_id: Uuid) -> AppResult<Vec<InboxRecord>> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(inbox_key(user_id))
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .into_iter()
            .filter_map(|(field, value)| match serde_json::from_str(&value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(user_id = %user_id, conversation_id = %field, error = %e, "Skipping corrupt inbox record");
                    None
                }
            })
            .collect())
    }

    async fn clear_unread(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<()> {
        self.set_field(user_id, conversation_id, "clear", true).await
    }

    async fn set_muted(&self, user_id: Uuid, conversation_id: Uuid, muted: bool) -> AppResult<()> {
        self.set_field(user_id, conversation_id, "muted", muted).await
    }

    async fn set_pinned(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        pinned: bool,
    ) -> AppResult<()> {
        self.set_field(user_id, conversation_id, "pinned", pinned).await
    }

    async fn recent_conversations(&self, user_id: Uuid, limit: usize) -> AppResult<Vec<Uuid>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let raw: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(conversation_list_key(user_id))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;
        Ok(raw.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
    }
}
