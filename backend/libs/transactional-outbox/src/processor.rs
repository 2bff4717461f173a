//! Polling relay from the outbox table to the event bus.
//!
//! Ordering is per claimed batch only. With several workers, or a row parked
//! in retry backoff while later rows publish, one conversation's events can
//! reach the bus out of order. Consumers order by the sequence carried in the
//! payload, never by arrival.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::OutboxMetrics;
use crate::{OutboxPublisher, OutboxRepository, OutboxResult, OutboxStatus};

#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Rows claimed per poll
    pub batch_size: i64,
    pub poll_interval: Duration,
    /// Attempts before a row is marked failed
    pub max_retries: i32,
    /// How long a claim hides a row from other workers
    pub claim_lease: Duration,
    pub cleanup_interval: Duration,
    /// Published rows older than this are deleted by cleanup
    pub retention: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_retries: 5,
            claim_lease: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Background worker that drains the outbox to the event bus.
///
/// - **At-least-once**: a row is marked published only after the broker acked it;
///   if marking fails the row is published again once its lease expires
/// - **Bounded retries**: rows that keep failing are marked `failed` and left
///   for manual replay instead of being retried forever
/// - **Cooperative**: any number of processors may share one table
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    config: OutboxProcessorConfig,
    metrics: Option<OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxProcessor<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: OutboxProcessorConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: None,
        }
    }

    /// Also update Prometheus metrics each polling cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll until `shutdown` flips to true. Errors are logged, never returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Outbox processor starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_batch().await {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        published = report.published,
                        retried = report.retried,
                        failed = report.failed,
                        "Outbox batch processed"
                    );
                }
                Ok(_) => debug!("No events to publish"),
                Err(e) => error!(error = ?e, "Outbox processor error"),
            }

            self.refresh_gauges().await;

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Outbox processor stopped");
    }

    /// Claim and publish one batch.
    pub async fn process_batch(&self) -> OutboxResult<BatchReport> {
        let events = self
            .repository
            .claim_pending(self.config.batch_size, self.config.claim_lease)
            .await?;

        let mut report = BatchReport {
            claimed: events.len(),
            ..BatchReport::default()
        };

        for event in events {
            match self.publisher.publish(&event).await {
                Ok(()) => {
                    if let Err(e) = self.repository.mark_published(event.id).await {
                        // Delivered but still pending: it will be published again
                        // after the lease, consumers dedupe on event_id.
                        error!(
                            event_id = %event.id,
                            error = ?e,
                            "Failed to mark event as published (event was delivered to Kafka)"
                        );
                    } else {
                        report.published += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                }
                Err(e) => {
                    let next_attempt = Self::calculate_backoff(event.retry_count + 1);
                    match self
                        .repository
                        .mark_failed(
                            event.id,
                            &e.to_string(),
                            self.config.max_retries,
                            next_attempt,
                        )
                        .await
                    {
                        Ok(OutboxStatus::Failed) => {
                            report.failed += 1;
                            if let Some(metrics) = &self.metrics {
                                metrics.failed.inc();
                            }
                            error!(
                                event_id = %event.id,
                                event_type = %event.event_type,
                                retry_count = event.retry_count + 1,
                                error = %e,
                                "Event exceeded max retries, marked failed (requires manual replay)"
                            );
                        }
                        Ok(_) => {
                            report.retried += 1;
                            if let Some(metrics) = &self.metrics {
                                metrics.retried.inc();
                            }
                            warn!(
                                event_id = %event.id,
                                event_type = %event.event_type,
                                retry_count = event.retry_count + 1,
                                backoff_secs = next_attempt.as_secs(),
                                error = %e,
                                "Failed to publish event, will retry"
                            );
                        }
                        Err(mark_err) => {
                            error!(
                                event_id = %event.id,
                                error = ?mark_err,
                                "Failed to record publish failure"
                            );
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Delete published rows past retention until `shutdown` flips to true.
    pub async fn run_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.cleanup_once().await {
                        Ok(0) => debug!("No published outbox events to clean up"),
                        Ok(deleted) => info!(deleted, "Cleaned up published outbox events"),
                        Err(e) => warn!(error = ?e, "Outbox cleanup failed, will retry next interval"),
                    }
                }
            }
        }

        info!("Outbox cleanup stopped");
    }

    pub async fn cleanup_once(&self) -> OutboxResult<u64> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        self.repository
            .delete_published_before(Utc::now() - retention)
            .await
    }

    async fn refresh_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            if let Ok((pending, age)) = self.repository.pending_stats().await {
                metrics.pending.set(pending);
                metrics.oldest_pending_age_seconds.set(age);
            }
        }
    }

    /// 2^retry_count seconds, capped at 5 minutes.
    fn calculate_backoff(retry_count: i32) -> Duration {
        const MAX_BACKOFF_SECS: u64 = 300;

        let exp = retry_count.clamp(0, 16) as u32;
        Duration::from_secs(2u64.pow(exp).min(MAX_BACKOFF_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutboxError, OutboxEvent};
    use async_trait::async_trait;
    use chrono::DateTime;
    use sqlx::{Postgres, Transaction};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// In-memory outbox that honours claim leases the way the SQL does.
    #[derive(Default)]
    struct MemoryOutbox {
        rows: Mutex<Vec<(OutboxEvent, Option<DateTime<Utc>>)>>,
    }

    impl MemoryOutbox {
        fn seed(&self, event: OutboxEvent) {
            self.rows.lock().unwrap().push((event, None));
        }

        fn get(&self, id: Uuid) -> OutboxEvent {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|(e, _)| e.id == id)
                .map(|(e, _)| e.clone())
                .unwrap()
        }

        fn expire_leases(&self) {
            for (_, lease) in self.rows.lock().unwrap().iter_mut() {
                *lease = None;
            }
        }
    }

    #[async_trait]
    impl OutboxRepository for MemoryOutbox {
        async fn insert(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            event: &OutboxEvent,
        ) -> OutboxResult<bool> {
            if self.rows.lock().unwrap().iter().any(|(e, _)| e.id == event.id) {
                return Ok(false);
            }
            self.seed(event.clone());
            Ok(true)
        }

        async fn claim_pending(
            &self,
            limit: i64,
            lease: Duration,
        ) -> OutboxResult<Vec<OutboxEvent>> {
            let now = Utc::now();
            let until = now + chrono::Duration::from_std(lease).unwrap();
            let mut rows = self.rows.lock().unwrap();
            let mut claimed = Vec::new();
            for (event, locked) in rows.iter_mut() {
                if claimed.len() as i64 >= limit {
                    break;
                }
                let free = locked.map(|l| l <= now).unwrap_or(true);
                if event.status == OutboxStatus::Pending && free {
                    *locked = Some(until);
                    claimed.push(event.clone());
                }
            }
            Ok(claimed)
        }

        async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let (event, lease) = rows
                .iter_mut()
                .find(|(e, _)| e.id == event_id && e.status == OutboxStatus::Pending)
                .ok_or(OutboxError::EventNotFound(event_id))?;
            event.status = OutboxStatus::Published;
            event.published_at = Some(Utc::now());
            *lease = None;
            Ok(())
        }

        async fn mark_failed(
            &self,
            event_id: Uuid,
            error: &str,
            max_retries: i32,
            retry_after: Duration,
        ) -> OutboxResult<OutboxStatus> {
            let mut rows = self.rows.lock().unwrap();
            let (event, lease) = rows
                .iter_mut()
                .find(|(e, _)| e.id == event_id && e.status == OutboxStatus::Pending)
                .ok_or(OutboxError::EventNotFound(event_id))?;
            event.retry_count += 1;
            event.last_error = Some(error.to_string());
            if event.retry_count >= max_retries {
                event.status = OutboxStatus::Failed;
            }
            *lease = Some(Utc::now() + chrono::Duration::from_std(retry_after).unwrap());
            Ok(event.status)
        }

        async fn delete_published_before(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let len = rows.len();
            rows.retain(|(e, _)| {
                !(e.status == OutboxStatus::Published
                    && e.published_at.map(|p| p < before).unwrap_or(false))
            });
            Ok((len - rows.len()) as u64)
        }

        async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
            let rows = self.rows.lock().unwrap();
            let pending = rows
                .iter()
                .filter(|(e, _)| e.status == OutboxStatus::Pending)
                .count();
            Ok((pending as i64, 0))
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        attempts: Mutex<Vec<Uuid>>,
        failing: Mutex<HashSet<Uuid>>,
    }

    impl RecordingPublisher {
        fn fail(&self, id: Uuid) {
            self.failing.lock().unwrap().insert(id);
        }

        fn attempts_for(&self, id: Uuid) -> usize {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .filter(|a| **a == id)
                .count()
        }
    }

    #[async_trait]
    impl OutboxPublisher for RecordingPublisher {
        async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
            self.attempts.lock().unwrap().push(event.id);
            if self.failing.lock().unwrap().contains(&event.id) {
                return Err(OutboxError::PublishFailed("broker down".into()));
            }
            Ok(())
        }
    }

    fn sent_event() -> OutboxEvent {
        let message_id = Uuid::new_v4();
        OutboxEvent::new(
            "message.sent",
            message_id,
            Uuid::new_v4(),
            Some(message_id),
            serde_json::json!({"seq": 1}),
        )
    }

    fn processor(
        repo: Arc<MemoryOutbox>,
        publisher: Arc<RecordingPublisher>,
        max_retries: i32,
    ) -> OutboxProcessor<MemoryOutbox, RecordingPublisher> {
        OutboxProcessor::new(
            repo,
            publisher,
            OutboxProcessorConfig {
                max_retries,
                ..OutboxProcessorConfig::default()
            },
        )
    }

    #[test]
    fn test_backoff_calculation() {
        type P = OutboxProcessor<MemoryOutbox, RecordingPublisher>;
        assert_eq!(P::calculate_backoff(0).as_secs(), 1);
        assert_eq!(P::calculate_backoff(1).as_secs(), 2);
        assert_eq!(P::calculate_backoff(2).as_secs(), 4);
        assert_eq!(P::calculate_backoff(5).as_secs(), 32);
        assert_eq!(P::calculate_backoff(10).as_secs(), 300); // capped
        assert_eq!(P::calculate_backoff(-3).as_secs(), 1);
    }

    #[tokio::test]
    async fn test_staged_event_published_once_after_restart() {
        // A row left pending by a crash is picked up by the first poll after restart.
        let repo = Arc::new(MemoryOutbox::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let event = sent_event();
        repo.seed(event.clone());

        let processor = processor(repo.clone(), publisher.clone(), 5);
        let first = processor.process_batch().await.unwrap();
        let second = processor.process_batch().await.unwrap();

        assert_eq!(first.published, 1);
        assert_eq!(second.claimed, 0);
        assert_eq!(publisher.attempts_for(event.id), 1);
        assert_eq!(repo.get(event.id).status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn test_failed_publish_stays_pending_with_backoff() {
        let repo = Arc::new(MemoryOutbox::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let event = sent_event();
        repo.seed(event.clone());
        publisher.fail(event.id);

        let processor = processor(repo.clone(), publisher.clone(), 5);
        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.retried, 1);

        let stored = repo.get(event.id);
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("Publish failed: broker down"));

        // backoff lease hides it from the very next poll
        let next = processor.process_batch().await.unwrap();
        assert_eq!(next.claimed, 0);
    }

    #[tokio::test]
    async fn test_event_marked_failed_after_max_retries() {
        let repo = Arc::new(MemoryOutbox::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let event = sent_event();
        repo.seed(event.clone());
        publisher.fail(event.id);

        let processor = processor(repo.clone(), publisher.clone(), 3);
        for _ in 0..3 {
            processor.process_batch().await.unwrap();
            repo.expire_leases();
        }

        assert_eq!(repo.get(event.id).status, OutboxStatus::Failed);
        assert_eq!(publisher.attempts_for(event.id), 3);

        // terminal: never claimed again
        repo.expire_leases();
        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(publisher.attempts_for(event.id), 3);
    }

    #[tokio::test]
    async fn test_concurrent_workers_do_not_double_publish() {
        let repo = Arc::new(MemoryOutbox::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let events: Vec<_> = (0..20).map(|_| sent_event()).collect();
        for e in &events {
            repo.seed(e.clone());
        }

        let a = processor(repo.clone(), publisher.clone(), 5);
        let b = processor(repo.clone(), publisher.clone(), 5);
        let (ra, rb) = tokio::join!(a.process_batch(), b.process_batch());

        assert_eq!(ra.unwrap().published + rb.unwrap().published, 20);
        for e in &events {
            assert_eq!(publisher.attempts_for(e.id), 1);
        }
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_published_rows() {
        let repo = Arc::new(MemoryOutbox::default());
        let publisher = Arc::new(RecordingPublisher::default());

        let mut old = sent_event();
        old.status = OutboxStatus::Published;
        old.published_at = Some(Utc::now() - chrono::Duration::days(8));
        let mut recent = sent_event();
        recent.status = OutboxStatus::Published;
        recent.published_at = Some(Utc::now());
        let pending = sent_event();
        for e in [old.clone(), recent.clone(), pending.clone()] {
            repo.seed(e);
        }

        let processor = processor(repo.clone(), publisher, 5);
        assert_eq!(processor.cleanup_once().await.unwrap(), 1);
        assert_eq!(repo.rows.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let repo = Arc::new(MemoryOutbox::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let processor = Arc::new(processor(repo, publisher, 5));
        let (tx, rx) = watch::channel(false);

        let handle = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(rx).await })
        };
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("processor should stop")
            .unwrap();
    }
}
