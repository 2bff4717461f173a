use std::sync::Arc;

use async_trait::async_trait;
use event_schema::{is_compatible, EventType, MessageEvent, SCHEMA_VERSION};
use reliable_consumer::{EventHandler, HandlerError};
use tracing::debug;

use crate::services::delivery::DeliveryRouter;

/// Decodes message events and hands them to the [`DeliveryRouter`].
///
/// Undecodable records are permanent failures (dead-lettered at once);
/// infrastructure errors from delivery are retryable.
pub struct DeliveryEventHandler {
    router: Arc<DeliveryRouter>,
}

impl DeliveryEventHandler {
    pub fn new(router: Arc<DeliveryRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl EventHandler for DeliveryEventHandler {
    async fn handle(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), HandlerError> {
        let event_type = EventType::from_topic(topic)
            .map_err(|e| HandlerError::permanent(e.to_string()))?;
        let envelope = MessageEvent::decode(event_type, payload)
            .map_err(|e| HandlerError::permanent(format!("decode {event_type}: {e}")))?;
        if !is_compatible(SCHEMA_VERSION, envelope.schema_version) {
            return Err(HandlerError::permanent(format!(
                "unsupported schema version {}",
                envelope.schema_version
            )));
        }

        let report = self.router.deliver(&envelope.data).await.map_err(|e| {
            if e.is_retryable() {
                HandlerError::retryable(e.to_string())
            } else {
                HandlerError::permanent(e.to_string())
            }
        })?;

        debug!(
            event_id = %envelope.event_id,
            event_type = %event_type,
            key = key.unwrap_or_default(),
            pushed = report.pushed,
            offline = report.offline,
            "Event delivered"
        );
        Ok(())
    }
}
