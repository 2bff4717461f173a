use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::{AckItem, AckStatus, FrameType, PendingAckItem};
use crate::repository::{InboxStore, PendingAckStore};
use crate::services::delivery::DeliveryRouter;

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// An unacknowledged push is resent after this long
    pub resend_interval: Duration,
    pub sweep_interval: Duration,
    /// Resends before an item is marked failed
    pub max_retry: i32,
    /// Items claimed per sweep
    pub sweep_batch: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            max_retry: 3,
            sweep_batch: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendReport {
    pub resent: usize,
    pub failed: usize,
}

/// Client acknowledgments and the resend sweep.
pub struct AckService {
    pending_acks: Arc<dyn PendingAckStore>,
    inbox: Arc<dyn InboxStore>,
    router: Arc<DeliveryRouter>,
    config: AckConfig,
}

impl AckService {
    pub fn new(
        pending_acks: Arc<dyn PendingAckStore>,
        inbox: Arc<dyn InboxStore>,
        router: Arc<DeliveryRouter>,
        config: AckConfig,
    ) -> Self {
        Self {
            pending_acks,
            inbox,
            router,
            config,
        }
    }

    /// Unknown items are a no-op: the entry may have been resent, failed or expired.
    pub async fn ack(&self, user_id: Uuid, message_id: Uuid) -> AppResult<bool> {
        let removed = self.pending_acks.remove(user_id, message_id).await?;
        if removed {
            metrics::ACKS_TOTAL.inc();
        } else {
            debug!(user_id = %user_id, message_id = %message_id, "Ack for unknown pending item");
        }
        Ok(removed)
    }

    /// Clear several items and advance each conversation's read watermark to
    /// the highest acknowledged seq.
    pub async fn batch_ack(&self, user_id: Uuid, items: &[AckItem]) -> AppResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let message_ids: Vec<Uuid> = items.iter().map(|i| i.message_id).collect();
        let removed = self.pending_acks.remove_batch(user_id, &message_ids).await?;
        metrics::ACKS_TOTAL.inc_by(removed as u64);

        let mut max_seq: HashMap<Uuid, i64> = HashMap::new();
        for item in items {
            let seq = max_seq.entry(item.conversation_id).or_insert(item.seq);
            *seq = (*seq).max(item.seq);
        }
        for (conversation_id, seq) in max_seq {
            self.inbox.mark_read(user_id, conversation_id, seq).await?;
        }

        Ok(removed)
    }

    pub async fn pending(&self, user_id: Uuid) -> AppResult<Vec<PendingAckItem>> {
        self.pending_acks.pending(user_id).await
    }

    pub async fn count(&self, user_id: Uuid) -> AppResult<usize> {
        self.pending_acks.count(user_id).await
    }

    /// One sweep: claim items due at `now`, resend them, count the exhausted ones.
    pub async fn resend_due(&self, now: DateTime<Utc>) -> AppResult<ResendReport> {
        let cutoff = now
            - chrono::Duration::from_std(self.config.resend_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let claimed = self
            .pending_acks
            .claim_due(
                cutoff.timestamp_millis(),
                now.timestamp_millis(),
                self.config.sweep_batch,
                self.config.max_retry,
            )
            .await?;

        let mut report = ResendReport::default();
        for item in claimed {
            if item.status == AckStatus::Failed {
                report.failed += 1;
                metrics::ACK_FAILED_TOTAL.inc();
                error!(
                    user_id = %item.user_id,
                    message_id = %item.message_id,
                    retry_count = item.retry_count,
                    "Push never acknowledged, giving up"
                );
                continue;
            }

            let frame = FrameType::MessageResend.encode(serde_json::json!({
                "message_id": item.message_id,
                "conversation_id": item.conversation_id,
                "seq": item.seq,
            }));
            match self.router.deliver_to_user(item.user_id, &frame).await {
                Ok(0) => debug!(user_id = %item.user_id, message_id = %item.message_id, "Resend found no device"),
                Ok(_) => {}
                Err(e) => warn!(user_id = %item.user_id, error = %e, "Resend failed"),
            }
            report.resent += 1;
            metrics::RESENDS_TOTAL.inc();
        }
        Ok(report)
    }

    pub async fn run_resend_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            resend_interval_secs = self.config.resend_interval.as_secs(),
            max_retry = self.config.max_retry,
            "Resend sweeper started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.resend_due(Utc::now()).await {
                        Ok(report) if report.resent + report.failed > 0 => {
                            debug!(resent = report.resent, failed = report.failed, "Resend sweep");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Resend sweep failed"),
                    }
                }
            }
        }
        info!("Resend sweeper stopped");
    }
}
