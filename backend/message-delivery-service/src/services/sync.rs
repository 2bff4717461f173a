use std::sync::Arc;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Message, UnreadConversation};
use crate::repository::{InboxStore, MembershipClient, MessageStore, Sequencer};

pub const DEFAULT_SYNC_LIMIT: i64 = 50;
pub const MAX_SYNC_LIMIT: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    pub conversation_id: Uuid,
    /// Last seq the client already has
    pub after_seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSync {
    pub conversation_id: Uuid,
    /// Ascending; revoked and deleted messages are included so clients can update them
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub latest_seq: i64,
}

/// Catch-up reads for reconnecting clients.
pub struct SyncService {
    store: Arc<dyn MessageStore>,
    sequencer: Arc<dyn Sequencer>,
    inbox: Arc<dyn InboxStore>,
    membership: Arc<dyn MembershipClient>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sequencer: Arc<dyn Sequencer>,
        inbox: Arc<dyn InboxStore>,
        membership: Arc<dyn MembershipClient>,
    ) -> Self {
        Self {
            store,
            sequencer,
            inbox,
            membership,
        }
    }

    /// Conversations the user is not a member of are skipped.
    pub async fn sync_messages(
        &self,
        user_id: Uuid,
        cursors: &[SyncCursor],
        limit: i64,
    ) -> AppResult<Vec<ConversationSync>> {
        let limit = if limit <= 0 {
            DEFAULT_SYNC_LIMIT
        } else {
            limit.min(MAX_SYNC_LIMIT)
        };

        let mut result = Vec::with_capacity(cursors.len());
        for cursor in cursors {
            let members = self
                .membership
                .list_member_ids(cursor.conversation_id)
                .await?;
            if !members.contains(&user_id) {
                warn!(
                    user_id = %user_id,
                    conversation_id = %cursor.conversation_id,
                    "Sync requested for a conversation the user is not in"
                );
                continue;
            }

            let mut messages = self
                .store
                .history_after(cursor.conversation_id, cursor.after_seq, limit + 1, true)
                .await?;
            let has_more = messages.len() as i64 > limit;
            messages.truncate(limit as usize);

            let latest_seq = self
                .sequencer
                .current(cursor.conversation_id)
                .await?
                .max(messages.last().map(|m| m.seq).unwrap_or(cursor.after_seq));

            result.push(ConversationSync {
                conversation_id: cursor.conversation_id,
                messages,
                has_more,
                latest_seq,
            });
        }
        Ok(result)
    }

    pub async fn unread_conversations(&self, user_id: Uuid) -> AppResult<Vec<UnreadConversation>> {
        self.inbox.unread_conversations(user_id).await
    }
}
