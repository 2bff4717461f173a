use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ConnectionArena;
use crate::error::{AppError, AppResult};

pub fn relay_channel(server_id: &str) -> String {
    format!("im:push:server:{}", server_id)
}

/// A frame addressed to a device attached to another instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub user_id: Uuid,
    pub device_id: String,
    pub frame: String,
}

#[async_trait]
pub trait RelayPublisher: Send + Sync {
    /// Fails when no instance is listening on `server_id`'s channel.
    async fn publish(&self, server_id: &str, envelope: &RelayEnvelope) -> AppResult<()>;
}

pub struct RedisPushRelay {
    redis: ConnectionManager,
}

impl RedisPushRelay {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RelayPublisher for RedisPushRelay {
    async fn publish(&self, server_id: &str, envelope: &RelayEnvelope) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(relay_channel(server_id))
            .arg(serde_json::to_string(envelope)?)
            .query_async(&mut conn)
            .await?;

        if receivers == 0 {
            return Err(AppError::Push(format!("no subscriber for server {server_id}")));
        }
        Ok(())
    }
}

/// Forward frames relayed to this instance into the local arena until shutdown.
///
/// PubSub needs a dedicated connection, not the shared manager.
pub async fn run_relay_subscriber(
    client: redis::Client,
    server_id: String,
    arena: ConnectionArena,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    let channel = relay_channel(&server_id);
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(&channel).await?;
    info!(channel = %channel, "Push relay subscriber started");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    warn!(channel = %channel, "Push relay stream closed");
                    return Err(AppError::Redis("pubsub stream closed".into()));
                };
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Unreadable relay payload");
                        continue;
                    }
                };
                match serde_json::from_str::<RelayEnvelope>(&payload) {
                    Ok(envelope) => {
                        if !arena.send(envelope.user_id, &envelope.device_id, &envelope.frame) {
                            debug!(
                                user_id = %envelope.user_id,
                                device_id = %envelope.device_id,
                                "Relayed frame for a device no longer attached"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "Undecodable relay envelope"),
                }
            }
        }
    }

    info!(channel = %channel, "Push relay subscriber stopped");
    Ok(())
}
