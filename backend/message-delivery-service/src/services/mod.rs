pub mod ack;
pub mod delivery;
pub mod event_handler;
pub mod message_service;
pub mod push;
pub mod session;
pub mod sync;

pub use ack::{AckConfig, AckService, ResendReport};
pub use delivery::{DeliveryConfig, DeliveryRouter, FanoutReport, ReplayReport};
pub use event_handler::DeliveryEventHandler;
pub use message_service::{MessageService, MessageServiceConfig};
pub use push::{KafkaPushNotifier, PushNotifier, PushTransport, RoutedPushTransport};
pub use session::SessionManager;
pub use sync::{ConversationSync, SyncCursor, SyncService};
