use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per (user, conversation) read/delivery watermarks.
///
/// Invariant: `last_read_seq <= last_delivered_seq`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub last_read_seq: i64,
    #[serde(default)]
    pub last_delivered_seq: i64,
    #[serde(default)]
    pub unread_count: i64,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub last_msg_seq: i64,
    /// Unix millis
    #[serde(default)]
    pub last_msg_time: i64,
}

impl InboxRecord {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadConversation {
    pub conversation_id: Uuid,
    pub unread_count: i64,
    pub last_msg_seq: i64,
    pub last_msg_time: i64,
    pub last_read_seq: i64,
}

impl From<&InboxRecord> for UnreadConversation {
    fn from(record: &InboxRecord) -> Self {
        Self {
            conversation_id: record.conversation_id,
            unread_count: record.unread_count,
            last_msg_seq: record.last_delivered_seq,
            last_msg_time: record.last_msg_time,
            last_read_seq: record.last_read_seq,
        }
    }
}
