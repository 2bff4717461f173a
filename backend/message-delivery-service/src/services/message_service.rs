use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use event_schema::{MessageEvent, MessageRead, MessageRevoked, MessageSent};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};
use transactional_outbox::OutboxEvent;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Message, MessageStatus, SendMessageRequest};
use crate::repository::timeline::serves_after;
use crate::repository::{
    CreateOutcome, InboxStore, MembershipClient, MessageStore, Sequencer, TimelineCache,
};

#[derive(Debug, Clone)]
pub struct MessageServiceConfig {
    /// Concurrent inbox updates per fan-out
    pub fanout_concurrency: usize,
    pub revoke_window: Duration,
    pub default_history_limit: i64,
    pub max_history_limit: i64,
    /// Must match the timeline cache window
    pub timeline_window: usize,
}

impl Default for MessageServiceConfig {
    fn default() -> Self {
        Self {
            fanout_concurrency: 50,
            revoke_window: Duration::from_secs(120),
            default_history_limit: 50,
            max_history_limit: 100,
            timeline_window: 100,
        }
    }
}

/// Message use-cases: send, read, revoke, delete, history.
pub struct MessageService {
    store: Arc<dyn MessageStore>,
    sequencer: Arc<dyn Sequencer>,
    timeline: Arc<dyn TimelineCache>,
    inbox: Arc<dyn InboxStore>,
    membership: Arc<dyn MembershipClient>,
    config: MessageServiceConfig,
}

fn event_payload(event: &MessageEvent) -> AppResult<serde_json::Value> {
    event
        .to_payload()
        .map_err(|e| AppError::Serialization(e.to_string()))
}

fn outbox_event(event: &MessageEvent) -> AppResult<OutboxEvent> {
    Ok(OutboxEvent::new(
        event.event_type().as_str(),
        event.aggregate_id(),
        event.conversation_id(),
        event.message_id(),
        event_payload(event)?,
    ))
}

/// One receipt per (reader, conversation, watermark).
pub fn read_receipt_id(user_id: Uuid, conversation_id: Uuid, read_seq: i64) -> Uuid {
    Uuid::new_v5(
        &conversation_id,
        format!("read:{}:{}", user_id, read_seq).as_bytes(),
    )
}

impl MessageService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sequencer: Arc<dyn Sequencer>,
        timeline: Arc<dyn TimelineCache>,
        inbox: Arc<dyn InboxStore>,
        membership: Arc<dyn MembershipClient>,
        config: MessageServiceConfig,
    ) -> Self {
        Self {
            store,
            sequencer,
            timeline,
            inbox,
            membership,
            config,
        }
    }

    /// Send a message. Idempotent on (sender, client_msg_id): a repeated call
    /// returns the committed message unchanged, including when two identical
    /// requests race.
    pub async fn send_message(&self, req: SendMessageRequest) -> AppResult<Message> {
        let content_type = req.validate()?;

        if let Some(existing) = self
            .store
            .get_by_idempotency_key(req.sender_id, &req.client_msg_id)
            .await?
        {
            debug!(
                message_id = %existing.id,
                client_msg_id = %req.client_msg_id,
                "Duplicate send, returning existing message"
            );
            self.refan_duplicate(&existing).await;
            return Ok(existing);
        }

        let members = self.membership.list_member_ids(req.conversation_id).await?;
        if !members.contains(&req.sender_id) {
            return Err(AppError::NotMember {
                user_id: req.sender_id,
                conversation_id: req.conversation_id,
            });
        }

        let seq = self.sequencer.next(req.conversation_id).await?;
        let message = Message::from_request(&req, content_type, seq);

        let event = outbox_event(&MessageEvent::Sent(MessageSent {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_ids: members.clone(),
            seq,
            content_type: content_type.into(),
            content: message.content.clone(),
            created_at: message.created_at,
        }))?;

        match self.store.create_with_event(&message, &event).await? {
            CreateOutcome::Created => {}
            CreateOutcome::Duplicate(winner) => {
                self.fan_out_inbox(&winner, &members).await;
                return Ok(winner);
            }
        }

        if let Err(e) = self.timeline.append(&message).await {
            warn!(
                conversation_id = %message.conversation_id,
                seq,
                error = %e,
                "Timeline append failed, dropping window"
            );
            // a window missing this seq must not serve reads
            if let Err(e) = self.timeline.invalidate(message.conversation_id).await {
                error!(
                    conversation_id = %message.conversation_id,
                    seq,
                    error = %e,
                    "Timeline invalidate failed"
                );
            }
        }
        self.fan_out_inbox(&message, &members).await;

        info!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            sender_id = %message.sender_id,
            seq,
            "Message sent"
        );
        Ok(message)
    }

    async fn refan_duplicate(&self, message: &Message) {
        match self.membership.list_member_ids(message.conversation_id).await {
            Ok(members) => self.fan_out_inbox(message, &members).await,
            Err(e) => warn!(
                message_id = %message.id,
                error = %e,
                "Skipping inbox re-fan-out for duplicate send"
            ),
        }
    }

    /// Inbox updates are guarded by the delivered watermark, so re-applying
    /// them for the same seq is harmless.
    async fn fan_out_inbox(&self, message: &Message, members: &[Uuid]) {
        let msg_time = message.created_at.timestamp_millis();
        let results: Vec<(Uuid, AppResult<bool>)> = stream::iter(members.iter().copied())
            .map(|member| async move {
                let result = self
                    .inbox
                    .update_delivered(
                        member,
                        message.conversation_id,
                        message.seq,
                        member == message.sender_id,
                        msg_time,
                    )
                    .await;
                (member, result)
            })
            .buffer_unordered(self.config.fanout_concurrency.max(1))
            .collect()
            .await;

        for (member, result) in results {
            if let Err(e) = result {
                warn!(
                    user_id = %member,
                    conversation_id = %message.conversation_id,
                    seq = message.seq,
                    error = %e,
                    "Inbox update failed"
                );
            }
        }
    }

    pub async fn get_message(&self, message_id: Uuid) -> AppResult<Message> {
        self.store.get(message_id).await?.ok_or(AppError::NotFound)
    }

    fn normalize_limit(&self, limit: i64) -> i64 {
        if limit <= 0 || limit > self.config.max_history_limit {
            self.config.default_history_limit
        } else {
            limit
        }
    }

    /// Visible messages after `after_seq`, ascending.
    pub async fn get_history(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let limit = self.normalize_limit(limit);

        match self.cached_floor(conversation_id).await {
            Some(floor) if after_seq + 1 >= floor => {
                match self
                    .timeline
                    .after(conversation_id, after_seq, self.config.timeline_window)
                    .await
                {
                    Ok(cached) => {
                        if self.covers_head(conversation_id, &cached, after_seq, limit).await {
                            return Ok(cached
                                .into_iter()
                                .filter(Message::is_visible)
                                .take(limit as usize)
                                .collect());
                        }
                        debug!(
                            conversation_id = %conversation_id,
                            after_seq,
                            cached = cached.len(),
                            "Timeline behind sequencer, reading store"
                        );
                    }
                    Err(e) => warn!(conversation_id = %conversation_id, error = %e, "Timeline read failed"),
                }
            }
            _ => {}
        }

        self.store
            .history_after(conversation_id, after_seq, limit, false)
            .await
    }

    /// Visible messages before `before_seq`, ascending.
    pub async fn get_history_before(
        &self,
        conversation_id: Uuid,
        before_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let limit = self.normalize_limit(limit);

        if let Some(floor) = self.cached_floor(conversation_id).await {
            match self
                .timeline
                .before(conversation_id, before_seq, self.config.timeline_window)
                .await
            {
                Ok(cached) => {
                    let visible: Vec<Message> =
                        cached.into_iter().filter(Message::is_visible).collect();
                    if visible.len() >= limit as usize || floor <= 1 {
                        let skip = visible.len().saturating_sub(limit as usize);
                        return Ok(visible.into_iter().skip(skip).collect());
                    }
                }
                Err(e) => warn!(conversation_id = %conversation_id, error = %e, "Timeline read failed"),
            }
        }

        self.store
            .history_before(conversation_id, before_seq, limit)
            .await
    }

    /// A short slice is only trusted when it reaches the last issued seq.
    async fn covers_head(
        &self,
        conversation_id: Uuid,
        cached: &[Message],
        after_seq: i64,
        limit: i64,
    ) -> bool {
        if serves_after(cached, after_seq, limit as usize, i64::MAX) {
            return true;
        }
        match self.sequencer.current(conversation_id).await {
            Ok(head) => serves_after(cached, after_seq, limit as usize, head),
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Sequencer head unavailable");
                false
            }
        }
    }

    /// Lowest cached seq, rebuilding an empty window from the store first.
    /// `None` means the cache cannot be used for this read.
    async fn cached_floor(&self, conversation_id: Uuid) -> Option<i64> {
        match self.timeline.floor_seq(conversation_id).await {
            Ok(Some(floor)) => return Some(floor),
            Ok(None) => {}
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Timeline unavailable");
                return None;
            }
        }

        let latest = match self
            .store
            .latest(conversation_id, self.config.timeline_window as i64)
            .await
        {
            Ok(latest) if !latest.is_empty() => latest,
            Ok(_) => return None,
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Timeline rebuild read failed");
                return None;
            }
        };
        if let Err(e) = self.timeline.rebuild(conversation_id, &latest).await {
            warn!(conversation_id = %conversation_id, error = %e, "Timeline rebuild failed");
            return None;
        }
        debug!(conversation_id = %conversation_id, cached = latest.len(), "Timeline rebuilt");
        latest.first().map(|m| m.seq)
    }

    /// Advance the read watermark; receipts are published only when it moved.
    pub async fn update_read(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        read_seq: i64,
    ) -> AppResult<bool> {
        if read_seq <= 0 {
            return Err(AppError::BadRequest("read_seq must be positive".into()));
        }
        let members = self.membership.list_member_ids(conversation_id).await?;
        if !members.contains(&user_id) {
            return Err(AppError::NotMember {
                user_id,
                conversation_id,
            });
        }

        let advanced = self
            .inbox
            .mark_read(user_id, conversation_id, read_seq)
            .await?;
        if !advanced {
            // the watermark may have moved on an earlier call whose receipt
            // never got staged; restaging under the same id is a no-op
            let at_watermark = self
                .inbox
                .get(user_id, conversation_id)
                .await?
                .map(|r| r.last_read_seq == read_seq)
                .unwrap_or(false);
            if !at_watermark {
                return Ok(false);
            }
        }

        let event = outbox_event(&MessageEvent::Read(MessageRead {
            user_id,
            conversation_id,
            receiver_ids: members.into_iter().filter(|m| *m != user_id).collect(),
            read_seq,
            read_at: Utc::now(),
        }))?
        .with_id(read_receipt_id(user_id, conversation_id, read_seq));
        let staged = self.store.stage_event(&event).await?;
        Ok(advanced || staged)
    }

    /// Sender only, normal messages only, within the revoke window.
    pub async fn revoke_message(&self, user_id: Uuid, message_id: Uuid) -> AppResult<Message> {
        let message = self.get_message(message_id).await?;
        message.check_revocable(user_id, Utc::now(), self.config.revoke_window)?;

        let members = self
            .membership
            .list_member_ids(message.conversation_id)
            .await?;
        let event = outbox_event(&MessageEvent::Revoked(MessageRevoked {
            message_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_ids: members,
        }))?;

        let updated = self
            .store
            .update_status(message_id, MessageStatus::Revoked, Some(&event))
            .await?;
        self.refresh_timeline(&updated).await;

        info!(message_id = %message_id, user_id = %user_id, "Message revoked");
        Ok(updated)
    }

    /// Soft delete by the sender.
    pub async fn delete_message(&self, user_id: Uuid, message_id: Uuid) -> AppResult<Message> {
        let message = self.get_message(message_id).await?;
        message.check_deletable(user_id)?;

        let updated = self
            .store
            .update_status(message_id, MessageStatus::Deleted, None)
            .await?;
        self.refresh_timeline(&updated).await;

        info!(message_id = %message_id, user_id = %user_id, "Message deleted");
        Ok(updated)
    }

    async fn refresh_timeline(&self, message: &Message) {
        if let Err(e) = self.timeline.replace(message).await {
            warn!(
                message_id = %message.id,
                seq = message.seq,
                error = %e,
                "Timeline update failed"
            );
        }
    }

    pub async fn get_unread_count(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<i64> {
        Ok(self
            .inbox
            .get(user_id, conversation_id)
            .await?
            .map(|r| r.unread_count)
            .unwrap_or(0))
    }

    pub async fn get_total_unread(&self, user_id: Uuid) -> AppResult<i64> {
        self.inbox.total_unread(user_id).await
    }

    /// Muted conversations keep counting unread but drop out of the total.
    pub async fn set_muted(&self, user_id: Uuid, conversation_id: Uuid, muted: bool) -> AppResult<()> {
        self.inbox.set_muted(user_id, conversation_id, muted).await
    }

    pub async fn set_pinned(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        pinned: bool,
    ) -> AppResult<()> {
        self.inbox.set_pinned(user_id, conversation_id, pinned).await
    }

    /// Mark everything delivered so far as read without emitting a receipt.
    pub async fn clear_unread(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<()> {
        self.inbox.clear_unread(user_id, conversation_id).await
    }

    /// Conversation ids by latest activity, newest first.
    pub async fn recent_conversations(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Uuid>> {
        let limit = self.normalize_limit(limit);
        self.inbox
            .recent_conversations(user_id, limit as usize)
            .await
    }
}
