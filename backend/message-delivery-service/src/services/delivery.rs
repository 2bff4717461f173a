//! Fan-out of committed events to recipients' devices.
//!
//! Online recipients get a realtime push plus a pending-ack entry, since the
//! transport itself guarantees nothing. Everyone else, including recipients
//! whose push failed, gets an offline entry (replayed on reconnect) and an
//! out-of-band notification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use event_schema::{MessageEvent, MessageSent};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::{
    DeviceRoute, FrameType, OfflineEntry, OfflineStatus, PendingAckItem, PushNotification,
};
use crate::repository::{OfflineStore, OnlineRegistry, PendingAckStore};
use crate::services::push::{PushNotifier, PushTransport};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Offline entries replayed per reconnect
    pub reconnect_batch: i64,
    /// Replay attempts before an offline entry is marked failed
    pub max_offline_attempts: i32,
    /// Delivered offline entries older than this are deleted
    pub offline_retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            reconnect_batch: 100,
            max_offline_attempts: 5,
            offline_retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub pushed: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct DeliveryRouter {
    online: Arc<dyn OnlineRegistry>,
    transport: Arc<dyn PushTransport>,
    pending_acks: Arc<dyn PendingAckStore>,
    offline: Arc<dyn OfflineStore>,
    notifier: Arc<dyn PushNotifier>,
    config: DeliveryConfig,
}

/// Frame body for a new message; `receiver_ids` stays server-side.
pub fn new_message_frame(event: &MessageSent) -> String {
    FrameType::NewMessage.encode(serde_json::json!({
        "message_id": event.message_id,
        "conversation_id": event.conversation_id,
        "sender_id": event.sender_id,
        "seq": event.seq,
        "content_type": event.content_type,
        "content": event.content,
        "created_at": event.created_at,
    }))
}

fn targets(receivers: &[Uuid], exclude: Uuid) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    receivers
        .iter()
        .copied()
        .filter(|id| *id != exclude && seen.insert(*id))
        .collect()
}

impl DeliveryRouter {
    pub fn new(
        online: Arc<dyn OnlineRegistry>,
        transport: Arc<dyn PushTransport>,
        pending_acks: Arc<dyn PendingAckStore>,
        offline: Arc<dyn OfflineStore>,
        notifier: Arc<dyn PushNotifier>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            online,
            transport,
            pending_acks,
            offline,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Route one decoded event. Errors are retryable and mean the event must
    /// be handled again; repeated handling is safe.
    pub async fn deliver(&self, event: &MessageEvent) -> AppResult<FanoutReport> {
        match event {
            MessageEvent::Sent(sent) => self.deliver_message(sent).await,
            MessageEvent::Read(read) => {
                let frame = FrameType::MessageRead.encode(serde_json::json!({
                    "user_id": read.user_id,
                    "conversation_id": read.conversation_id,
                    "read_seq": read.read_seq,
                    "read_at": read.read_at,
                }));
                Ok(self
                    .broadcast_online(&targets(&read.receiver_ids, read.user_id), &frame)
                    .await)
            }
            MessageEvent::Revoked(revoked) => {
                let frame = FrameType::MessageRevoked.encode(serde_json::json!({
                    "message_id": revoked.message_id,
                    "conversation_id": revoked.conversation_id,
                    "sender_id": revoked.sender_id,
                }));
                Ok(self
                    .broadcast_online(&targets(&revoked.receiver_ids, revoked.sender_id), &frame)
                    .await)
            }
        }
    }

    async fn deliver_message(&self, event: &MessageSent) -> AppResult<FanoutReport> {
        let receivers = targets(&event.receiver_ids, event.sender_id);
        let frame = new_message_frame(event);
        let routes = self.lookup_routes(&receivers).await;

        let mut report = FanoutReport::default();
        for user_id in receivers {
            let devices = routes.get(&user_id).map(Vec::as_slice).unwrap_or_default();
            if self.push_to_devices(user_id, devices, &frame).await > 0 {
                let item = PendingAckItem::new(user_id, event.message_id, event.conversation_id, event.seq);
                if let Err(e) = self.pending_acks.register(&item).await {
                    warn!(
                        user_id = %user_id,
                        message_id = %event.message_id,
                        error = %e,
                        "Failed to register pending ack"
                    );
                }
                report.pushed += 1;
                continue;
            }

            self.store_offline(user_id, event, &frame).await?;
            report.offline += 1;
        }

        debug!(
            message_id = %event.message_id,
            conversation_id = %event.conversation_id,
            seq = event.seq,
            pushed = report.pushed,
            offline = report.offline,
            "Message fanned out"
        );
        Ok(report)
    }

    /// Registry failure means nobody is reachable; everyone goes offline.
    async fn lookup_routes(&self, user_ids: &[Uuid]) -> HashMap<Uuid, Vec<DeviceRoute>> {
        match self.online.online_devices_batch(user_ids).await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, receivers = user_ids.len(), "Online registry unavailable, treating receivers as offline");
                HashMap::new()
            }
        }
    }

    /// Returns the number of devices that accepted the frame.
    async fn push_to_devices(&self, user_id: Uuid, devices: &[DeviceRoute], frame: &str) -> usize {
        let mut delivered = 0;
        for route in devices {
            match self.transport.push(user_id, route, frame).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(
                    user_id = %user_id,
                    device_id = %route.device_id,
                    error = %e,
                    "Push to device failed"
                ),
            }
        }
        delivered
    }

    async fn store_offline(&self, user_id: Uuid, event: &MessageSent, frame: &str) -> AppResult<()> {
        let entry = OfflineEntry {
            user_id,
            message_id: event.message_id,
            conversation_id: event.conversation_id,
            seq: event.seq,
            payload: frame.to_string(),
        };
        let inserted = self.offline.save(&entry).await?;
        if !inserted {
            debug!(user_id = %user_id, message_id = %event.message_id, "Offline entry already stored");
            return Ok(());
        }
        metrics::OFFLINE_SAVED_TOTAL.inc();

        let notification = PushNotification {
            user_id,
            title: "New message".to_string(),
            body: "You have a new message".to_string(),
            data: HashMap::from([
                ("conversation_id".to_string(), event.conversation_id.to_string()),
                ("message_id".to_string(), event.message_id.to_string()),
                ("seq".to_string(), event.seq.to_string()),
            ]),
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(user_id = %user_id, error = %e, "Push notification failed");
        }
        Ok(())
    }

    async fn broadcast_online(&self, user_ids: &[Uuid], frame: &str) -> FanoutReport {
        let routes = self.lookup_routes(user_ids).await;
        let mut report = FanoutReport::default();
        for user_id in user_ids {
            if let Some(devices) = routes.get(user_id) {
                if self.push_to_devices(*user_id, devices, frame).await > 0 {
                    report.pushed += 1;
                }
            }
        }
        report
    }

    /// Best-effort push to every connected device of `user_id`.
    pub async fn deliver_to_user(&self, user_id: Uuid, frame: &str) -> AppResult<usize> {
        let devices = self.online.devices(user_id).await?;
        Ok(self.push_to_devices(user_id, &devices, frame).await)
    }

    /// Replay stored entries after `user_id` (re)connected.
    ///
    /// Entries that reach a device are marked delivered and tracked for ack,
    /// so a repeated handshake finds nothing left to send.
    pub async fn process_pending_on_reconnect(&self, user_id: Uuid) -> AppResult<ReplayReport> {
        let mut report = ReplayReport::default();
        let entries = self
            .offline
            .pending(user_id, self.config.reconnect_batch)
            .await?;
        if entries.is_empty() {
            return Ok(report);
        }

        let devices = self.online.devices(user_id).await?;
        if devices.is_empty() {
            debug!(user_id = %user_id, pending = entries.len(), "No device attached, keeping offline entries");
            return Ok(report);
        }

        for entry in entries {
            if self.push_to_devices(user_id, &devices, &entry.payload).await > 0 {
                if self.offline.mark_delivered(entry.id).await? {
                    let item =
                        PendingAckItem::new(user_id, entry.message_id, entry.conversation_id, entry.seq);
                    if let Err(e) = self.pending_acks.register(&item).await {
                        warn!(user_id = %user_id, message_id = %entry.message_id, error = %e, "Failed to register pending ack");
                    }
                    report.delivered += 1;
                    metrics::OFFLINE_REPLAYED_TOTAL
                        .with_label_values(&["delivered"])
                        .inc();
                }
                continue;
            }

            match self
                .offline
                .incr_retry(entry.id, self.config.max_offline_attempts)
                .await?
            {
                OfflineStatus::Failed => {
                    report.failed += 1;
                    metrics::OFFLINE_REPLAYED_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    error!(
                        user_id = %user_id,
                        message_id = %entry.message_id,
                        attempts = entry.retry_count + 1,
                        "Offline message permanently failed"
                    );
                }
                _ => {
                    report.retried += 1;
                    metrics::OFFLINE_REPLAYED_TOTAL
                        .with_label_values(&["retry"])
                        .inc();
                }
            }
        }

        info!(
            user_id = %user_id,
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            "Offline messages replayed"
        );
        Ok(report)
    }

    /// Delete delivered offline entries past retention, until shutdown.
    pub async fn run_offline_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let retention = chrono::Duration::from_std(self.config.offline_retention)
                        .unwrap_or_else(|_| chrono::Duration::days(7));
                    match self.offline.delete_delivered_before(Utc::now() - retention).await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "Cleaned up delivered offline messages"),
                        Err(e) => warn!(error = %e, "Offline cleanup failed"),
                    }
                }
            }
        }
        info!("Offline cleanup stopped");
    }
}
