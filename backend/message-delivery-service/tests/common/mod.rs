//! In-memory fakes for every storage and transport seam, plus a harness that
//! wires the real services on top of them.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_schema::{EventEnvelope, EventType};
use message_delivery_service::error::{AppError, AppResult};
use message_delivery_service::models::{
    AckStatus, ContentType, DeviceRoute, InboxRecord, Message, MessageStatus, OfflineEntry,
    OfflineStatus, PendingAckItem, PendingMessage, PushNotification, SendMessageRequest,
};
use message_delivery_service::repository::{
    CreateOutcome, InboxStore, MembershipClient, MessageStore, OfflineStore, OnlineRegistry,
    PendingAckStore, Sequencer, TimelineCache,
};
use message_delivery_service::services::{
    AckConfig, AckService, DeliveryConfig, DeliveryEventHandler, DeliveryRouter, MessageService,
    MessageServiceConfig, PushNotifier, RoutedPushTransport, SessionManager, SyncService,
};
use message_delivery_service::state::AppState;
use message_delivery_service::websocket::{
    ConnectionArena, ConnectionId, RelayEnvelope, RelayPublisher,
};
use reliable_consumer::{EventHandler, HandlerError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use transactional_outbox::OutboxEvent;
use uuid::Uuid;

pub const SERVER_ID: &str = "server-a";

// ---------------------------------------------------------------------------
// Message store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<Message>>,
    pub events: Mutex<Vec<OutboxEvent>>,
    /// Fail the next `stage_event` call, then recover.
    pub fail_next_stage: AtomicBool,
}

impl MemoryMessageStore {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn events_of(&self, event_type: &str) -> Vec<OutboxEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_with_event(
        &self,
        msg: &Message,
        event: &OutboxEvent,
    ) -> AppResult<CreateOutcome> {
        tokio::task::yield_now().await;
        let mut messages = self.messages.lock().unwrap();
        if let Some(existing) = messages
            .iter()
            .find(|m| m.sender_id == msg.sender_id && m.client_msg_id == msg.client_msg_id)
        {
            return Ok(CreateOutcome::Duplicate(existing.clone()));
        }
        if messages
            .iter()
            .any(|m| m.conversation_id == msg.conversation_id && m.seq == msg.seq)
        {
            return Err(AppError::SeqConflict {
                conversation_id: msg.conversation_id,
                seq: msg.seq,
            });
        }
        messages.push(msg.clone());
        self.events.lock().unwrap().push(event.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn get_by_idempotency_key(
        &self,
        sender_id: Uuid,
        client_msg_id: &str,
    ) -> AppResult<Option<Message>> {
        let found = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.sender_id == sender_id && m.client_msg_id == client_msg_id)
            .cloned();
        // let concurrent senders interleave between lookup and insert
        tokio::task::yield_now().await;
        Ok(found)
    }

    async fn history_after(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
        limit: i64,
        include_hidden: bool,
    ) -> AppResult<Vec<Message>> {
        let mut found: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.seq > after_seq)
            .filter(|m| include_hidden || m.is_visible())
            .cloned()
            .collect();
        found.sort_by_key(|m| m.seq);
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn history_before(
        &self,
        conversation_id: Uuid,
        before_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let mut found: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.seq < before_seq)
            .filter(|m| m.is_visible())
            .cloned()
            .collect();
        found.sort_by_key(|m| std::cmp::Reverse(m.seq));
        found.truncate(limit as usize);
        found.reverse();
        Ok(found)
    }

    async fn update_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        event: Option<&OutboxEvent>,
    ) -> AppResult<Message> {
        let mut messages = self.messages.lock().unwrap();
        let msg = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(AppError::NotFound)?;
        msg.status = status;
        msg.updated_at = Utc::now();
        if let Some(event) = event {
            self.events.lock().unwrap().push(event.clone());
        }
        Ok(msg.clone())
    }

    async fn stage_event(&self, event: &OutboxEvent) -> AppResult<bool> {
        if self.fail_next_stage.swap(false, Ordering::SeqCst) {
            return Err(AppError::Internal("outbox insert failed".into()));
        }
        let mut events = self.events.lock().unwrap();
        if events.iter().any(|e| e.id == event.id) {
            return Ok(false);
        }
        events.push(event.clone());
        Ok(true)
    }

    async fn max_seq(&self, conversation_id: Uuid) -> AppResult<i64> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.seq)
            .max()
            .unwrap_or(0))
    }

    async fn latest(&self, conversation_id: Uuid, limit: i64) -> AppResult<Vec<Message>> {
        let mut found: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.seq);
        let skip = found.len().saturating_sub(limit as usize);
        Ok(found.into_iter().skip(skip).collect())
    }
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySequencer {
    counters: Mutex<HashMap<Uuid, i64>>,
    pub unavailable: AtomicBool,
}

#[async_trait]
impl Sequencer for MemorySequencer {
    async fn next(&self, conversation_id: Uuid) -> AppResult<i64> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Redis("connection refused".into()));
        }
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(conversation_id).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn current(&self, conversation_id: Uuid) -> AppResult<i64> {
        Ok(*self
            .counters
            .lock()
            .unwrap()
            .get(&conversation_id)
            .unwrap_or(&0))
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

pub struct MemoryTimeline {
    window: usize,
    entries: Mutex<HashMap<Uuid, BTreeMap<i64, Message>>>,
    pub fail_appends: AtomicBool,
    pub fail_invalidates: AtomicBool,
}

impl MemoryTimeline {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
            fail_appends: AtomicBool::new(false),
            fail_invalidates: AtomicBool::new(false),
        }
    }

    pub fn cached(&self, conversation_id: Uuid) -> Vec<Message> {
        self.entries
            .lock()
            .unwrap()
            .get(&conversation_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, conversation_id: Uuid) {
        self.entries.lock().unwrap().remove(&conversation_id);
    }
}

#[async_trait]
impl TimelineCache for MemoryTimeline {
    async fn append(&self, msg: &Message) -> AppResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(AppError::Redis("timeline write refused".into()));
        }
        let mut entries = self.entries.lock().unwrap();
        let window = entries.entry(msg.conversation_id).or_default();
        window.insert(msg.seq, msg.clone());
        while window.len() > self.window {
            let lowest = *window.keys().next().unwrap();
            window.remove(&lowest);
        }
        Ok(())
    }

    async fn after(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        Ok(self
            .cached(conversation_id)
            .into_iter()
            .filter(|m| m.seq > after_seq)
            .take(limit)
            .collect())
    }

    async fn before(
        &self,
        conversation_id: Uuid,
        before_seq: i64,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let below: Vec<Message> = self
            .cached(conversation_id)
            .into_iter()
            .filter(|m| m.seq < before_seq)
            .collect();
        let skip = below.len().saturating_sub(limit);
        Ok(below.into_iter().skip(skip).collect())
    }

    async fn replace(&self, msg: &Message) -> AppResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries
            .get_mut(&msg.conversation_id)
            .and_then(|w| w.get_mut(&msg.seq))
        {
            Some(slot) => {
                *slot = msg.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn floor_seq(&self, conversation_id: Uuid) -> AppResult<Option<i64>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&conversation_id)
            .and_then(|w| w.keys().next().copied()))
    }

    async fn rebuild(&self, conversation_id: Uuid, messages: &[Message]) -> AppResult<()> {
        let mut window = BTreeMap::new();
        for msg in messages.iter().rev().take(self.window) {
            window.insert(msg.seq, msg.clone());
        }
        self.entries.lock().unwrap().insert(conversation_id, window);
        Ok(())
    }

    async fn invalidate(&self, conversation_id: Uuid) -> AppResult<()> {
        if self.fail_invalidates.load(Ordering::SeqCst) {
            return Err(AppError::Redis("timeline write refused".into()));
        }
        self.clear(conversation_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryInbox {
    records: Mutex<HashMap<(Uuid, Uuid), InboxRecord>>,
}

#[async_trait]
impl InboxStore for MemoryInbox {
    async fn update_delivered(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        seq: i64,
        is_sender: bool,
        msg_time: i64,
    ) -> AppResult<bool> {
        let mut records = self.records.lock().unwrap();
        let rec = records
            .entry((user_id, conversation_id))
            .or_insert_with(|| InboxRecord::new(conversation_id));
        if seq <= rec.last_delivered_seq {
            return Ok(false);
        }
        rec.last_delivered_seq = seq;
        rec.last_msg_seq = seq;
        rec.last_msg_time = msg_time;
        if is_sender {
            rec.last_read_seq = rec.last_read_seq.max(seq);
            rec.unread_count = 0;
        } else {
            rec.unread_count += 1;
        }
        Ok(true)
    }

    async fn mark_read(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        read_seq: i64,
    ) -> AppResult<bool> {
        let mut records = self.records.lock().unwrap();
        let rec = records
            .entry((user_id, conversation_id))
            .or_insert_with(|| InboxRecord::new(conversation_id));
        if read_seq <= rec.last_read_seq {
            return Ok(false);
        }
        rec.last_read_seq = read_seq;
        rec.last_delivered_seq = rec.last_delivered_seq.max(read_seq);
        rec.unread_count = (rec.last_delivered_seq - read_seq).max(0);
        Ok(true)
    }

    async fn get(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<Option<InboxRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(user_id, conversation_id))
            .cloned())
    }

    async fn all(&self, user_id: Uuid) -> AppResult<Vec<InboxRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|((uid, _), _)| *uid == user_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn clear_unread(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<()> {
        if let Some(rec) = self
            .records
            .lock()
            .unwrap()
            .get_mut(&(user_id, conversation_id))
        {
            rec.last_read_seq = rec.last_delivered_seq;
            rec.unread_count = 0;
        }
        Ok(())
    }

    async fn set_muted(&self, user_id: Uuid, conversation_id: Uuid, muted: bool) -> AppResult<()> {
        self.records
            .lock()
            .unwrap()
            .entry((user_id, conversation_id))
            .or_insert_with(|| InboxRecord::new(conversation_id))
            .muted = muted;
        Ok(())
    }

    async fn set_pinned(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        pinned: bool,
    ) -> AppResult<()> {
        self.records
            .lock()
            .unwrap()
            .entry((user_id, conversation_id))
            .or_insert_with(|| InboxRecord::new(conversation_id))
            .pinned = pinned;
        Ok(())
    }

    async fn recent_conversations(&self, user_id: Uuid, limit: usize) -> AppResult<Vec<Uuid>> {
        let mut records = self.all(user_id).await?;
        records.sort_by(|a, b| b.last_msg_time.cmp(&a.last_msg_time));
        Ok(records
            .into_iter()
            .take(limit)
            .map(|r| r.conversation_id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryMembership {
    members: Mutex<HashMap<Uuid, Vec<Uuid>>>,
    pub unavailable: AtomicBool,
}

impl MemoryMembership {
    pub fn set(&self, conversation_id: Uuid, members: Vec<Uuid>) {
        self.members.lock().unwrap().insert(conversation_id, members);
    }
}

#[async_trait]
impl MembershipClient for MemoryMembership {
    async fn list_member_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::MembershipUnavailable("timeout".into()));
        }
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Online registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryOnline {
    routes: Mutex<HashMap<Uuid, Vec<DeviceRoute>>>,
    pub unavailable: AtomicBool,
}

impl MemoryOnline {
    fn check(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Redis("registry down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl OnlineRegistry for MemoryOnline {
    async fn set_online(&self, user_id: Uuid, route: &DeviceRoute) -> AppResult<()> {
        self.check()?;
        let mut routes = self.routes.lock().unwrap();
        let devices = routes.entry(user_id).or_default();
        devices.retain(|r| r.device_id != route.device_id);
        devices.push(route.clone());
        Ok(())
    }

    async fn set_offline(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        self.check()?;
        if let Some(devices) = self.routes.lock().unwrap().get_mut(&user_id) {
            devices.retain(|r| r.device_id != device_id);
        }
        Ok(())
    }

    async fn devices(&self, user_id: Uuid) -> AppResult<Vec<DeviceRoute>> {
        self.check()?;
        Ok(self
            .routes
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn online_devices_batch(
        &self,
        user_ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, Vec<DeviceRoute>>> {
        self.check()?;
        let routes = self.routes.lock().unwrap();
        Ok(user_ids
            .iter()
            .filter_map(|uid| {
                routes
                    .get(uid)
                    .filter(|d| !d.is_empty())
                    .map(|d| (*uid, d.clone()))
            })
            .collect())
    }

    async fn touch(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        self.check()?;
        if let Some(devices) = self.routes.lock().unwrap().get_mut(&user_id) {
            for route in devices.iter_mut().filter(|r| r.device_id == device_id) {
                route.last_ping_at = Utc::now();
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pending acks
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPendingAck {
    items: Mutex<HashMap<(Uuid, Uuid), PendingAckItem>>,
}

impl MemoryPendingAck {
    pub fn item(&self, user_id: Uuid, message_id: Uuid) -> Option<PendingAckItem> {
        self.items.lock().unwrap().get(&(user_id, message_id)).cloned()
    }

    /// Pretend the item was last sent at `sent_at`.
    pub fn backdate(&self, user_id: Uuid, message_id: Uuid, sent_at: DateTime<Utc>) {
        if let Some(item) = self.items.lock().unwrap().get_mut(&(user_id, message_id)) {
            item.sent_at = sent_at.timestamp_millis();
        }
    }
}

#[async_trait]
impl PendingAckStore for MemoryPendingAck {
    async fn register(&self, item: &PendingAckItem) -> AppResult<()> {
        self.items
            .lock()
            .unwrap()
            .insert((item.user_id, item.message_id), item.clone());
        Ok(())
    }

    async fn remove(&self, user_id: Uuid, message_id: Uuid) -> AppResult<bool> {
        Ok(self.remove_batch(user_id, &[message_id]).await? > 0)
    }

    async fn remove_batch(&self, user_id: Uuid, message_ids: &[Uuid]) -> AppResult<usize> {
        let mut items = self.items.lock().unwrap();
        let mut removed = 0;
        for mid in message_ids {
            if let Some(item) = items.get(&(user_id, *mid)) {
                if item.status == AckStatus::Pending {
                    removed += 1;
                }
                items.remove(&(user_id, *mid));
            }
        }
        Ok(removed)
    }

    async fn pending(&self, user_id: Uuid) -> AppResult<Vec<PendingAckItem>> {
        let mut pending: Vec<PendingAckItem> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.user_id == user_id && i.status == AckStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|i| i.sent_at);
        Ok(pending)
    }

    async fn count(&self, user_id: Uuid) -> AppResult<usize> {
        Ok(self.pending(user_id).await?.len())
    }

    async fn claim_due(
        &self,
        cutoff_ms: i64,
        now_ms: i64,
        limit: usize,
        max_retry: i32,
    ) -> AppResult<Vec<PendingAckItem>> {
        let mut items = self.items.lock().unwrap();
        let mut due: Vec<&mut PendingAckItem> = items
            .values_mut()
            .filter(|i| i.status == AckStatus::Pending && i.sent_at <= cutoff_ms)
            .collect();
        due.sort_by_key(|i| i.sent_at);

        let mut claimed = Vec::new();
        for item in due.into_iter().take(limit) {
            if item.retry_count >= max_retry {
                item.status = AckStatus::Failed;
            } else {
                item.retry_count += 1;
                item.sent_at = now_ms;
            }
            claimed.push(item.clone());
        }
        Ok(claimed)
    }
}

// ---------------------------------------------------------------------------
// Offline store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryOffline {
    rows: Mutex<Vec<PendingMessage>>,
    pub unavailable: AtomicBool,
}

impl MemoryOffline {
    pub fn rows_for(&self, user_id: Uuid) -> Vec<PendingMessage> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OfflineStore for MemoryOffline {
    async fn save(&self, entry: &OfflineEntry) -> AppResult<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Database("pool timed out".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|r| r.user_id == entry.user_id && r.message_id == entry.message_id)
        {
            return Ok(false);
        }
        let id = rows.len() as i64 + 1;
        rows.push(PendingMessage {
            id,
            user_id: entry.user_id,
            message_id: entry.message_id,
            conversation_id: entry.conversation_id,
            seq: entry.seq,
            payload: entry.payload.clone(),
            status: OfflineStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            delivered_at: None,
        });
        Ok(true)
    }

    async fn pending(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<PendingMessage>> {
        let mut pending: Vec<PendingMessage> = self
            .rows_for(user_id)
            .into_iter()
            .filter(|r| r.status == OfflineStatus::Pending)
            .collect();
        pending.sort_by_key(|r| (r.conversation_id, r.seq));
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn mark_delivered(&self, id: i64) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows
            .iter_mut()
            .find(|r| r.id == id && r.status == OfflineStatus::Pending)
        {
            Some(row) => {
                row.status = OfflineStatus::Delivered;
                row.delivered_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_retry(&self, id: i64, max_attempts: i32) -> AppResult<OfflineStatus> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(AppError::NotFound)?;
        row.retry_count += 1;
        if row.retry_count >= max_attempts {
            row.status = OfflineStatus::Failed;
        }
        Ok(row.status)
    }

    async fn delete_delivered_before(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let mut rows = self.rows.lock().unwrap();
        let len = rows.len();
        rows.retain(|r| {
            !(r.status == OfflineStatus::Delivered && r.delivered_at.is_some_and(|d| d < before))
        });
        Ok((len - rows.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Push side
// ---------------------------------------------------------------------------

/// Relay that hands frames straight to the arena of the addressed instance.
#[derive(Default)]
pub struct MemoryRelay {
    instances: Mutex<HashMap<String, ConnectionArena>>,
    pub relayed: Mutex<Vec<(String, RelayEnvelope)>>,
}

impl MemoryRelay {
    pub fn attach(&self, server_id: &str, arena: ConnectionArena) {
        self.instances
            .lock()
            .unwrap()
            .insert(server_id.to_string(), arena);
    }
}

#[async_trait]
impl RelayPublisher for MemoryRelay {
    async fn publish(&self, server_id: &str, envelope: &RelayEnvelope) -> AppResult<()> {
        self.relayed
            .lock()
            .unwrap()
            .push((server_id.to_string(), envelope.clone()));
        let arena = self
            .instances
            .lock()
            .unwrap()
            .get(server_id)
            .cloned()
            .ok_or_else(|| AppError::Push(format!("no subscriber for server {server_id}")))?;
        if arena.send(envelope.user_id, &envelope.device_id, &envelope.frame) {
            Ok(())
        } else {
            Err(AppError::Push("device gone".into()))
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<PushNotification>>,
}

#[async_trait]
impl PushNotifier for RecordingNotifier {
    async fn notify(&self, notification: &PushNotification) -> AppResult<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// One service instance wired over shared fakes.
pub struct Harness {
    pub store: Arc<MemoryMessageStore>,
    pub sequencer: Arc<MemorySequencer>,
    pub timeline: Arc<MemoryTimeline>,
    pub inbox: Arc<MemoryInbox>,
    pub membership: Arc<MemoryMembership>,
    pub online: Arc<MemoryOnline>,
    pub pending_acks: Arc<MemoryPendingAck>,
    pub offline: Arc<MemoryOffline>,
    pub relay: Arc<MemoryRelay>,
    pub notifier: Arc<RecordingNotifier>,
    pub arena: ConnectionArena,
    pub router: Arc<DeliveryRouter>,
    pub messages: Arc<MessageService>,
    pub acks: Arc<AckService>,
    pub sync: Arc<SyncService>,
    pub sessions: Arc<SessionManager>,
    pub handler: DeliveryEventHandler,
    relayed_events: AtomicUsize,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_configs(DeliveryConfig::default(), AckConfig::default())
    }

    pub fn with_configs(delivery: DeliveryConfig, ack: AckConfig) -> Self {
        let store = Arc::new(MemoryMessageStore::default());
        let sequencer = Arc::new(MemorySequencer::default());
        let timeline = Arc::new(MemoryTimeline::new(100));
        let inbox = Arc::new(MemoryInbox::default());
        let membership = Arc::new(MemoryMembership::default());
        let online = Arc::new(MemoryOnline::default());
        let pending_acks = Arc::new(MemoryPendingAck::default());
        let offline = Arc::new(MemoryOffline::default());
        let relay = Arc::new(MemoryRelay::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let arena = ConnectionArena::new();
        relay.attach(SERVER_ID, arena.clone());

        let transport = Arc::new(RoutedPushTransport::new(
            SERVER_ID,
            arena.clone(),
            relay.clone(),
        ));
        let router = Arc::new(DeliveryRouter::new(
            online.clone(),
            transport,
            pending_acks.clone(),
            offline.clone(),
            notifier.clone(),
            delivery,
        ));

        let messages = Arc::new(MessageService::new(
            store.clone(),
            sequencer.clone(),
            timeline.clone(),
            inbox.clone(),
            membership.clone(),
            MessageServiceConfig::default(),
        ));
        let acks = Arc::new(AckService::new(
            pending_acks.clone(),
            inbox.clone(),
            router.clone(),
            ack,
        ));
        let sync = Arc::new(SyncService::new(
            store.clone(),
            sequencer.clone(),
            inbox.clone(),
            membership.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            SERVER_ID,
            arena.clone(),
            online.clone(),
            router.clone(),
        ));
        let handler = DeliveryEventHandler::new(router.clone());

        Self {
            store,
            sequencer,
            timeline,
            inbox,
            membership,
            online,
            pending_acks,
            offline,
            relay,
            notifier,
            arena,
            router,
            messages,
            acks,
            sync,
            sessions,
            handler,
            relayed_events: AtomicUsize::new(0),
        }
    }

    /// Hand every outbox row staged since the last call to the event handler,
    /// enveloped the way the outbox publisher puts it on the wire.
    pub async fn relay_outbox(&self) -> Vec<Result<(), HandlerError>> {
        let events: Vec<OutboxEvent> = {
            let staged = self.store.events.lock().unwrap();
            let from = self.relayed_events.swap(staged.len(), Ordering::SeqCst);
            staged[from..].to_vec()
        };

        let mut results = Vec::with_capacity(events.len());
        for event in events {
            let topic = EventType::from_str(&event.event_type).unwrap().topic();
            let envelope = EventEnvelope::new("message-delivery-service", &event.payload)
                .with_event_id(event.id);
            let bytes = serde_json::to_vec(&envelope).unwrap();
            let key = event.conversation_id.to_string();
            results.push(self.handler.handle(topic, Some(&key), &bytes).await);
        }
        results
    }

    /// Connect a device through the session manager and return its frame stream.
    pub async fn connect(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> (ConnectionId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let (connection_id, _) = self
            .sessions
            .on_connect(user_id, device_id, tx)
            .await
            .unwrap();
        (connection_id, rx)
    }

    /// Handler state over the same services the harness drives.
    pub fn app_state(&self) -> AppState {
        AppState {
            messages: self.messages.clone(),
            sync: self.sync.clone(),
            sessions: self.sessions.clone(),
            acks: self.acks.clone(),
        }
    }

    /// New conversation with the given members.
    pub fn conversation(&self, members: &[Uuid]) -> Uuid {
        let conversation_id = Uuid::new_v4();
        self.membership.set(conversation_id, members.to_vec());
        conversation_id
    }
}

pub fn text_request(
    conversation_id: Uuid,
    sender_id: Uuid,
    client_msg_id: &str,
    text: &str,
) -> SendMessageRequest {
    SendMessageRequest {
        conversation_id,
        sender_id,
        client_msg_id: client_msg_id.to_string(),
        content_type: ContentType::Text.into(),
        content: serde_json::json!({ "text": text }),
        reply_to_id: None,
    }
}

/// Decode every queued frame as JSON.
pub fn drain_frames(rx: &mut UnboundedReceiver<String>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}
