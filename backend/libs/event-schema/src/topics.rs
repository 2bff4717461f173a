//! Kafka topic names shared by producers and consumers.

pub const MESSAGE_NEW: &str = "im.message.new";
pub const MESSAGE_READ: &str = "im.message.read";
pub const MESSAGE_REVOKED: &str = "im.message.revoked";

/// Delayed-retry channel for events whose handler failed
pub const MESSAGE_RETRY: &str = "im.message.retry";

/// Events that exhausted their retry budget, kept for manual inspection
pub const MESSAGE_DEAD_LETTER: &str = "im.message.dead_letter";

/// Offline push notification requests consumed by the notification pipeline
pub const PUSH_NOTIFICATION: &str = "im.push.notification";

/// Topics the delivery consumer subscribes to (retry channel excluded).
pub fn delivery_topics() -> [&'static str; 3] {
    [MESSAGE_NEW, MESSAGE_READ, MESSAGE_REVOKED]
}
