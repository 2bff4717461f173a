use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, EventHandler, InboundRecord, Outcome};
use crate::{ConsumerResult, EnvelopeSink};

/// Kafka consumer configuration
#[derive(Clone, Debug)]
pub struct ReliableConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    /// First wait after a failed retry/dead-letter produce
    pub routing_backoff: Duration,
    pub max_routing_backoff: Duration,
    /// Upper bound on the pause after re-enqueueing a retry record that is not due
    pub max_defer_pause: Duration,
}

impl ReliableConsumerConfig {
    /// Consumer for the source topics.
    pub fn main(brokers: &str, group_id: &str, topics: &[&str]) -> Self {
        Self {
            brokers: brokers.to_string(),
            group_id: group_id.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            routing_backoff: Duration::from_millis(500),
            max_routing_backoff: Duration::from_secs(30),
            max_defer_pause: Duration::from_secs(1),
        }
    }

    /// Consumer for the retry topic. Uses its own group so a slow retry
    /// partition never holds back the source topics.
    pub fn retry(brokers: &str, group_id: &str, retry_topic: &str) -> Self {
        Self::main(brokers, &format!("{group_id}-retry"), &[retry_topic])
    }
}

/// Kafka consumer with manual offset commits.
///
/// An offset is committed only after the record was handled or routed to the
/// retry/dead-letter topic. If routing fails it is retried with backoff until
/// it succeeds or shutdown is requested; on shutdown the offset is left
/// uncommitted and the record is re-delivered on the next start.
pub struct ReliableConsumer<H: EventHandler, S: EnvelopeSink> {
    consumer: StreamConsumer,
    dispatcher: Arc<Dispatcher<H, S>>,
    config: ReliableConsumerConfig,
}

impl<H: EventHandler, S: EnvelopeSink> ReliableConsumer<H, S> {
    pub fn new(
        config: ReliableConsumerConfig,
        dispatcher: Arc<Dispatcher<H, S>>,
    ) -> ConsumerResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .create()?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topics = ?config.topics,
            "Reliable consumer initialized"
        );

        Ok(Self {
            consumer,
            dispatcher,
            config,
        })
    }

    /// Run the consumer loop until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(group_id = %self.config.group_id, "Shutdown signal received, stopping consumer");
                        break;
                    }
                }

                message = self.consumer.recv() => {
                    match message {
                        Ok(msg) => {
                            let Some(payload) = msg.payload() else {
                                debug!(topic = %msg.topic(), "Empty message payload, skipping");
                                self.commit(&msg);
                                continue;
                            };

                            let record = InboundRecord {
                                topic: msg.topic().to_string(),
                                key: msg
                                    .key()
                                    .and_then(|k| std::str::from_utf8(k).ok())
                                    .map(str::to_string),
                                payload: payload.to_vec(),
                            };

                            if !self.route(&record, &mut shutdown).await {
                                warn!(
                                    topic = %record.topic,
                                    partition = msg.partition(),
                                    offset = msg.offset(),
                                    "Stopping with record unrouted, offset not committed"
                                );
                                break;
                            }
                            self.commit(&msg);
                        }
                        Err(e) => {
                            error!(error = %e, "Kafka consumer error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        info!(group_id = %self.config.group_id, "Reliable consumer stopped");
    }

    /// Returns false when shutdown interrupted routing.
    async fn route(&self, record: &InboundRecord, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut backoff = self.config.routing_backoff;

        loop {
            match self.dispatcher.dispatch(record, Utc::now()).await {
                Ok(Outcome::Deferred { until }) => {
                    let pause = (until - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(self.config.max_defer_pause);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                    return true;
                }
                Ok(_) => return true,
                Err(e) => {
                    error!(
                        topic = %record.topic,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to route record, retrying"
                    );
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return false;
                            }
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_routing_backoff);
                }
            }
        }
    }

    fn commit(&self, msg: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(msg, CommitMode::Async) {
            warn!(error = %e, "Failed to commit Kafka offset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_role_uses_own_group() {
        let main = ReliableConsumerConfig::main(
            "localhost:9092",
            "delivery",
            &["im.message.new", "im.message.read"],
        );
        let retry = ReliableConsumerConfig::retry("localhost:9092", "delivery", "im.message.retry");

        assert_eq!(main.group_id, "delivery");
        assert_eq!(main.topics.len(), 2);
        assert_eq!(retry.group_id, "delivery-retry");
        assert_eq!(retry.topics, vec!["im.message.retry".to_string()]);
        assert_eq!(retry.max_defer_pause, Duration::from_secs(1));
    }
}
