//! Storage adapters. Each trait is the seam services depend on; the Redis and
//! Postgres implementations live next to it.

pub mod inbox;
pub mod membership;
pub mod messages;
pub mod offline;
pub mod online;
pub mod pending_ack;
pub mod sequencer;
pub mod timeline;

pub use inbox::{InboxStore, RedisInbox};
pub use membership::{MembershipClient, PgMembership};
pub use messages::{CreateOutcome, MessageStore, PgMessageStore};
pub use offline::{OfflineStore, PgOfflineStore};
pub use online::{OnlineRegistry, RedisOnlineRegistry};
pub use pending_ack::{PendingAckStore, RedisPendingAck};
pub use sequencer::{RedisSequencer, Sequencer};
pub use timeline::{RedisTimeline, TimelineCache};
