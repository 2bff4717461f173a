pub mod delivery;
pub mod inbox;
pub mod message;

pub use delivery::{
    AckItem, AckStatus, ClientFrame, DeviceRoute, FrameType, OfflineEntry, OfflineStatus,
    PendingAckItem, PendingMessage, PushNotification,
};
pub use inbox::{InboxRecord, UnreadConversation};
pub use message::{ContentType, Message, MessageStatus, SendMessageRequest};
