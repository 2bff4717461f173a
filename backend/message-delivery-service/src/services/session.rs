use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::DeviceRoute;
use crate::repository::OnlineRegistry;
use crate::services::delivery::{DeliveryRouter, ReplayReport};
use crate::websocket::{ConnectionArena, ConnectionId};

/// Connect, disconnect and heartbeat for devices attached to this instance.
pub struct SessionManager {
    server_id: String,
    arena: ConnectionArena,
    online: Arc<dyn OnlineRegistry>,
    router: Arc<DeliveryRouter>,
}

impl SessionManager {
    pub fn new(
        server_id: impl Into<String>,
        arena: ConnectionArena,
        online: Arc<dyn OnlineRegistry>,
        router: Arc<DeliveryRouter>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            arena,
            online,
            router,
        }
    }

    /// Attach the device, publish its route, then replay what it missed.
    pub async fn on_connect(
        &self,
        user_id: Uuid,
        device_id: &str,
        sender: UnboundedSender<String>,
    ) -> AppResult<(ConnectionId, ReplayReport)> {
        let connection_id = self.arena.register(user_id, device_id, sender);
        metrics::LOCAL_CONNECTIONS.set(self.arena.len() as i64);

        let route = DeviceRoute::new(device_id, self.server_id.clone());
        self.online.set_online(user_id, &route).await?;

        let report = self.router.process_pending_on_reconnect(user_id).await?;
        info!(
            user_id = %user_id,
            device_id = %device_id,
            replayed = report.delivered,
            "Device connected"
        );
        Ok((connection_id, report))
    }

    /// A stale disconnect (the device already reconnected) changes nothing.
    pub async fn on_disconnect(
        &self,
        user_id: Uuid,
        device_id: &str,
        connection_id: ConnectionId,
    ) -> AppResult<()> {
        if !self.arena.unregister(user_id, device_id, connection_id) {
            return Ok(());
        }
        metrics::LOCAL_CONNECTIONS.set(self.arena.len() as i64);

        if let Err(e) = self.online.set_offline(user_id, device_id).await {
            warn!(user_id = %user_id, device_id = %device_id, error = %e, "Failed to clear online route");
            return Err(e);
        }
        info!(user_id = %user_id, device_id = %device_id, "Device disconnected");
        Ok(())
    }

    pub async fn on_heartbeat(&self, user_id: Uuid, device_id: &str) -> AppResult<()> {
        self.online.touch(user_id, device_id).await
    }
}
