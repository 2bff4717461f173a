use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::debug;

use crate::{ConsumerError, ConsumerResult};

/// Destination for retry and dead-letter records.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: &[(&str, String)],
    ) -> ConsumerResult<()>;
}

/// Kafka-backed sink. The producer should use `acks=all`.
pub struct KafkaEnvelopeSink {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaEnvelopeSink {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl EnvelopeSink for KafkaEnvelopeSink {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: &[(&str, String)],
    ) -> ConsumerResult<()> {
        let mut owned = OwnedHeaders::new();
        for (name, value) in headers {
            owned = owned.insert(Header {
                key: name,
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&payload)
            .headers(owned);

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(topic = %topic, partition, offset, "Routed record");
                Ok(())
            }
            Err((e, _)) => Err(ConsumerError::RoutingFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
