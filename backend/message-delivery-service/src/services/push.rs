use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_schema::topics;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{DeviceRoute, PushNotification};
use crate::websocket::{ConnectionArena, RelayEnvelope, RelayPublisher};

/// Sends one serialized frame to one device, wherever it is attached.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn push(&self, user_id: Uuid, route: &DeviceRoute, frame: &str) -> AppResult<()>;
}

/// Local arena for devices on this instance, pub/sub relay for the rest.
pub struct RoutedPushTransport {
    server_id: String,
    arena: ConnectionArena,
    relay: Arc<dyn RelayPublisher>,
}

impl RoutedPushTransport {
    pub fn new(
        server_id: impl Into<String>,
        arena: ConnectionArena,
        relay: Arc<dyn RelayPublisher>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            arena,
            relay,
        }
    }
}

#[async_trait]
impl PushTransport for RoutedPushTransport {
    async fn push(&self, user_id: Uuid, route: &DeviceRoute, frame: &str) -> AppResult<()> {
        if route.server_id == self.server_id {
            let sent = self.arena.send(user_id, &route.device_id, frame);
            let result = if sent { "ok" } else { "error" };
            metrics::PUSHES_TOTAL
                .with_label_values(&["local", result])
                .inc();
            return if sent {
                Ok(())
            } else {
                Err(AppError::Push(format!(
                    "device {} of user {} is not attached",
                    route.device_id, user_id
                )))
            };
        }

        let envelope = RelayEnvelope {
            user_id,
            device_id: route.device_id.clone(),
            frame: frame.to_string(),
        };
        let outcome = self.relay.publish(&route.server_id, &envelope).await;
        let result = if outcome.is_ok() { "ok" } else { "error" };
        metrics::PUSHES_TOTAL
            .with_label_values(&["relay", result])
            .inc();
        debug!(
            user_id = %user_id,
            device_id = %route.device_id,
            server_id = %route.server_id,
            ok = outcome.is_ok(),
            "Relayed push"
        );
        outcome
    }
}

/// Out-of-band notification (APNs/FCM) for recipients that are not connected.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, notification: &PushNotification) -> AppResult<()>;
}

/// Hands notifications to the notification pipeline over Kafka.
pub struct KafkaPushNotifier {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaPushNotifier {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            topic: topics::PUSH_NOTIFICATION.to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl PushNotifier for KafkaPushNotifier {
    async fn notify(&self, notification: &PushNotification) -> AppResult<()> {
        let payload = serde_json::to_vec(notification)?;
        let key = notification.user_id.to_string();

        self.producer
            .send(
                FutureRecord::to(&self.topic).key(&key).payload(&payload),
                self.timeout,
            )
            .await
            .map_err(|(e, _)| AppError::EventBus(e.to_string()))?;
        Ok(())
    }
}
