use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use event_schema::{EventEnvelope, EventType};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::info;

use crate::{OutboxError, OutboxEvent, OutboxResult};

/// Publisher trait for sending staged events to the event bus.
///
/// Implementations may be invoked more than once for the same event
/// (at-least-once); consumers dedupe on the envelope `event_id`.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Kafka publisher.
///
/// - topic is derived from the event type (`message.sent` -> `im.message.new`)
/// - key is the conversation id, so one conversation stays on one partition
/// - payload is an [`EventEnvelope`] whose `event_id` is the outbox row id
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    source: String,
    delivery_timeout: Duration,
}

impl KafkaOutboxPublisher {
    /// `producer` should be created with `enable.idempotence=true` and `acks=all`.
    pub fn new(producer: FutureProducer, source: impl Into<String>) -> Self {
        Self {
            producer,
            source: source.into(),
            delivery_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    fn topic_for(event_type: &str) -> OutboxResult<&'static str> {
        EventType::from_str(event_type)
            .map(|t| t.topic())
            .map_err(|_| OutboxError::UnroutableEvent(event_type.to_string()))
    }

    fn envelope<'a>(&self, event: &'a OutboxEvent) -> EventEnvelope<&'a serde_json::Value> {
        let mut envelope = EventEnvelope::new(self.source.clone(), &event.payload)
            .with_event_id(event.id);
        envelope.timestamp = event.created_at;
        if let Some(cid) = event.correlation_id() {
            envelope = envelope.with_correlation_id(cid);
        }
        envelope
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let topic = Self::topic_for(&event.event_type)?;

        let payload = serde_json::to_string(&self.envelope(event))
            .context("Failed to serialize event envelope")?;

        let event_id = event.id.to_string();
        let aggregate_id = event.aggregate_id.to_string();
        let key = event.conversation_id.to_string();
        let created_at = event.created_at.to_rfc3339();

        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_type",
                value: Some(event.event_type.as_bytes()),
            })
            .insert(Header {
                key: "event_id",
                value: Some(event_id.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_id",
                value: Some(aggregate_id.as_bytes()),
            })
            .insert(Header {
                key: "conversation_id",
                value: Some(key.as_bytes()),
            })
            .insert(Header {
                key: "created_at",
                value: Some(created_at.as_bytes()),
            });

        let correlation_id = event.correlation_id().map(|c| c.to_string());
        if let Some(cid) = &correlation_id {
            headers = headers.insert(Header {
                key: "correlation_id",
                value: Some(cid.as_bytes()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| {
                OutboxError::PublishFailed(format!("Kafka publish failed: {}", err))
            })?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            topic = %topic,
            "Event published to Kafka"
        );

        Ok(())
    }
}
