use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::envelope::{embed_payload, payload_bytes, DeadLetterMessage, RetryMessage};
use crate::metrics::ConsumerMetrics;
use crate::policy::{Disposition, FailurePolicy};
use crate::{ConsumerResult, EnvelopeSink, HandlerError};

/// Business logic invoked for every record on a source topic.
///
/// Retry records are unwrapped first, so `topic` is always the original topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, topic: &str, key: Option<&str>, payload: &[u8])
        -> Result<(), HandlerError>;
}

/// A consumed record, detached from the Kafka client.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Retried { retry_count: u32 },
    DeadLettered { retry_count: u32 },
    /// Retry record not yet due, put back on the retry topic unchanged
    Deferred { until: DateTime<Utc> },
}

/// Routes one record through the handler and, on failure, to the retry or
/// dead-letter topic. Holds no Kafka consumer so it can be driven directly.
///
/// An `Ok` return means the record is fully dealt with and its offset may be
/// committed. An `Err` means routing itself failed and the record must not be
/// committed.
pub struct Dispatcher<H: EventHandler, S: EnvelopeSink> {
    handler: Arc<H>,
    sink: Arc<S>,
    policy: FailurePolicy,
    retry_topic: String,
    dead_letter_topic: String,
    metrics: Option<ConsumerMetrics>,
}

impl<H: EventHandler, S: EnvelopeSink> Dispatcher<H, S> {
    pub fn new(
        handler: Arc<H>,
        sink: Arc<S>,
        policy: FailurePolicy,
        retry_topic: impl Into<String>,
        dead_letter_topic: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            sink,
            policy,
            retry_topic: retry_topic.into(),
            dead_letter_topic: dead_letter_topic.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retry_topic(&self) -> &str {
        &self.retry_topic
    }

    pub async fn dispatch(
        &self,
        record: &InboundRecord,
        now: DateTime<Utc>,
    ) -> ConsumerResult<Outcome> {
        let key = record.key.clone().unwrap_or_default();

        if record.topic != self.retry_topic {
            return self
                .attempt(&record.topic, &key, &record.payload, 0, now)
                .await;
        }

        let retry: RetryMessage = match serde_json::from_slice(&record.payload) {
            Ok(retry) => retry,
            Err(e) => {
                warn!(error = %e, "Undecodable retry record, dead-lettering");
                let dead = DeadLetterMessage {
                    original_topic: record.topic.clone(),
                    original_key: key,
                    payload: embed_payload(&record.payload),
                    error_msg: format!("undecodable retry record: {e}"),
                    retry_count: 0,
                    created_at: now.timestamp(),
                    last_retry_at: now.timestamp(),
                };
                self.send_dead_letter(&dead).await?;
                return Ok(Outcome::DeadLettered { retry_count: 0 });
            }
        };

        if !retry.is_due(now) {
            self.send_retry(&retry).await?;
            if let Some(metrics) = &self.metrics {
                metrics
                    .deferred
                    .with_label_values(&[&retry.original_topic])
                    .inc();
            }
            return Ok(Outcome::Deferred {
                until: retry.next_retry_time(),
            });
        }

        let payload = payload_bytes(&retry.payload);
        self.attempt(
            &retry.original_topic,
            &retry.original_key,
            &payload,
            retry.retry_count,
            now,
        )
        .await
    }

    async fn attempt(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        previous_failures: u32,
        now: DateTime<Utc>,
    ) -> ConsumerResult<Outcome> {
        let key_ref = (!key.is_empty()).then_some(key);
        let err = match self.handler.handle(topic, key_ref, payload).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.handled.with_label_values(&[topic]).inc();
                }
                return Ok(Outcome::Handled);
            }
            Err(err) => err,
        };

        match self.policy.decide(previous_failures, &err) {
            Disposition::Retry { retry_count, delay } => {
                let delay = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5));
                let retry = RetryMessage {
                    original_topic: topic.to_string(),
                    original_key: key.to_string(),
                    payload: embed_payload(payload),
                    retry_count,
                    next_retry_at: (now + delay).timestamp(),
                };
                self.send_retry(&retry).await?;

                if let Some(metrics) = &self.metrics {
                    metrics.retried.with_label_values(&[topic]).inc();
                }
                info!(
                    topic = %topic,
                    key = %key,
                    retry_count,
                    next_retry_at = retry.next_retry_at,
                    error = %err,
                    "Message sent to retry queue"
                );
                Ok(Outcome::Retried { retry_count })
            }
            Disposition::DeadLetter { retry_count } => {
                let dead = DeadLetterMessage {
                    original_topic: topic.to_string(),
                    original_key: key.to_string(),
                    payload: embed_payload(payload),
                    error_msg: err.message().to_string(),
                    retry_count,
                    created_at: now.timestamp(),
                    last_retry_at: now.timestamp(),
                };
                self.send_dead_letter(&dead).await?;

                if let Some(metrics) = &self.metrics {
                    metrics.dead_lettered.with_label_values(&[topic]).inc();
                }
                warn!(
                    topic = %topic,
                    key = %key,
                    retry_count,
                    error = %err,
                    "Message sent to dead letter queue"
                );
                Ok(Outcome::DeadLettered { retry_count })
            }
        }
    }

    async fn send_retry(&self, retry: &RetryMessage) -> ConsumerResult<()> {
        let payload = serde_json::to_vec(retry)?;
        self.sink
            .send(
                &self.retry_topic,
                &retry.original_key,
                payload,
                &[
                    ("retry_count", retry.retry_count.to_string()),
                    ("next_retry_at", retry.next_retry_at.to_string()),
                ],
            )
            .await
    }

    async fn send_dead_letter(&self, dead: &DeadLetterMessage) -> ConsumerResult<()> {
        let payload = serde_json::to_vec(dead)?;
        self.sink
            .send(
                &self.dead_letter_topic,
                &dead.original_key,
                payload,
                &[
                    ("original_topic", dead.original_topic.clone()),
                    ("error_msg", dead.error_msg.clone()),
                ],
            )
            .await
    }
}
