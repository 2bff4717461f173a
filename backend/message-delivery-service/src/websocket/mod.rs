use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

pub mod relay;

pub use relay::{relay_channel, run_relay_subscriber, RedisPushRelay, RelayEnvelope, RelayPublisher};

/// Unique identifier for one realtime connection
///
/// A device that reconnects gets a new id, so a late cleanup from the old
/// connection cannot remove the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

struct Connection {
    id: ConnectionId,
    sender: UnboundedSender<String>,
}

/// Connections attached to this instance, keyed by (user, device).
///
/// Only this process writes to the arena. Other instances reach these
/// connections through the push relay.
#[derive(Default, Clone)]
pub struct ConnectionArena {
    inner: Arc<DashMap<(Uuid, String), Connection>>,
}

impl ConnectionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device, replacing any previous connection for the same device.
    pub fn register(
        &self,
        user_id: Uuid,
        device_id: &str,
        sender: UnboundedSender<String>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        let replaced = self
            .inner
            .insert((user_id, device_id.to_string()), Connection { id, sender });

        tracing::debug!(
            user_id = %user_id,
            device_id = %device_id,
            replaced = replaced.is_some(),
            total = self.inner.len(),
            "Registered connection"
        );
        id
    }

    /// Detach a device, only if `connection_id` still owns the slot.
    pub fn unregister(&self, user_id: Uuid, device_id: &str, connection_id: ConnectionId) -> bool {
        self.inner
            .remove_if(&(user_id, device_id.to_string()), |_, conn| {
                conn.id == connection_id
            })
            .is_some()
    }

    /// Queue a frame. A closed receiver prunes the entry and returns false.
    pub fn send(&self, user_id: Uuid, device_id: &str, frame: &str) -> bool {
        let key = (user_id, device_id.to_string());
        let dead = match self.inner.get(&key) {
            Some(conn) => match conn.sender.send(frame.to_string()) {
                Ok(()) => return true,
                Err(_) => conn.id,
            },
            None => return false,
        };

        self.inner.remove_if(&key, |_, conn| conn.id == dead);
        tracing::debug!(user_id = %user_id, device_id = %device_id, "Pruned dead connection");
        false
    }

    pub fn devices(&self, user_id: Uuid) -> Vec<String> {
        let mut devices: Vec<String> = self
            .inner
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        devices.sort();
        devices
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_register_replaces_previous_connection() {
        let arena = ConnectionArena::new();
        let user = Uuid::new_v4();
        let (old_tx, mut old_rx) = unbounded_channel();
        let (new_tx, mut new_rx) = unbounded_channel();

        let old_id = arena.register(user, "phone", old_tx);
        let new_id = arena.register(user, "phone", new_tx);
        assert_eq!(arena.len(), 1);

        assert!(arena.send(user, "phone", "hello"));
        assert_eq!(new_rx.try_recv().unwrap(), "hello");
        assert!(old_rx.try_recv().is_err());

        // stale cleanup from the first connection is ignored
        assert!(!arena.unregister(user, "phone", old_id));
        assert_eq!(arena.len(), 1);
        assert!(arena.unregister(user, "phone", new_id));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_dead_sender_is_pruned() {
        let arena = ConnectionArena::new();
        let user = Uuid::new_v4();
        let (tx, rx) = unbounded_channel();
        arena.register(user, "web", tx);
        drop(rx);

        assert!(!arena.send(user, "web", "frame"));
        assert!(arena.is_empty());
        assert!(!arena.send(user, "web", "frame"));
    }

    #[test]
    fn test_devices_lists_only_that_user() {
        let arena = ConnectionArena::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, _rx) = unbounded_channel();
        arena.register(a, "web", tx.clone());
        arena.register(a, "phone", tx.clone());
        arena.register(b, "phone", tx);

        assert_eq!(arena.devices(a), vec!["phone".to_string(), "web".to_string()]);
        assert_eq!(arena.devices(b).len(), 1);
    }
}
