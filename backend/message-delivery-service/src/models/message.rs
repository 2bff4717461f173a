use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const MAX_CLIENT_MSG_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum ContentType {
    Text = 1,
    Image = 2,
    Audio = 3,
    Video = 4,
    File = 5,
    Location = 6,
    System = 7,
}

impl TryFrom<i16> for ContentType {
    type Error = AppError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ContentType::Text,
            2 => ContentType::Image,
            3 => ContentType::Audio,
            4 => ContentType::Video,
            5 => ContentType::File,
            6 => ContentType::Location,
            7 => ContentType::System,
            other => return Err(AppError::BadRequest(format!("unknown content type {other}"))),
        })
    }
}

impl From<ContentType> for i16 {
    fn from(value: ContentType) -> Self {
        value as i16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum MessageStatus {
    Revoked = 0,
    Normal = 1,
    Deleted = 2,
}

impl TryFrom<i16> for MessageStatus {
    type Error = AppError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageStatus::Revoked,
            1 => MessageStatus::Normal,
            2 => MessageStatus::Deleted,
            other => return Err(AppError::Internal(format!("unknown message status {other}"))),
        })
    }
}

impl From<MessageStatus> for i16 {
    fn from(value: MessageStatus) -> Self {
        value as i16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub client_msg_id: String,
    pub seq: i64,
    pub content_type: ContentType,
    pub content: serde_json::Value,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Build a message from a validated request and an issued seq.
    pub fn from_request(req: &SendMessageRequest, content_type: ContentType, seq: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: req.conversation_id,
            sender_id: req.sender_id,
            client_msg_id: req.client_msg_id.clone(),
            seq,
            content_type,
            content: req.content.clone(),
            status: MessageStatus::Normal,
            reply_to_id: req.reply_to_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.status == MessageStatus::Normal
    }

    /// Only the sender may revoke, only a normal message, only within `window`.
    pub fn check_revocable(&self, user_id: Uuid, now: DateTime<Utc>, window: Duration) -> AppResult<()> {
        if self.sender_id != user_id {
            return Err(AppError::Forbidden("only the sender can revoke a message".into()));
        }
        if self.status != MessageStatus::Normal {
            return Err(AppError::InvalidState);
        }
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(2));
        if now - self.created_at > window {
            return Err(AppError::RevokeWindowExpired {
                created_at: self.created_at,
                max_revoke_seconds: window.num_seconds(),
            });
        }
        Ok(())
    }

    pub fn check_deletable(&self, user_id: Uuid) -> AppResult<()> {
        if self.sender_id != user_id {
            return Err(AppError::Forbidden("only the sender can delete a message".into()));
        }
        if self.status == MessageStatus::Deleted {
            return Err(AppError::InvalidState);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Idempotency key chosen by the client
    pub client_msg_id: String,
    pub content_type: i16,
    pub content: serde_json::Value,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
}

impl SendMessageRequest {
    pub fn validate(&self) -> AppResult<ContentType> {
        if self.client_msg_id.trim().is_empty() {
            return Err(AppError::BadRequest("client_msg_id is required".into()));
        }
        if self.client_msg_id.len() > MAX_CLIENT_MSG_ID_LEN {
            return Err(AppError::BadRequest(format!(
                "client_msg_id exceeds {MAX_CLIENT_MSG_ID_LEN} bytes"
            )));
        }
        if self.content.is_null() {
            return Err(AppError::BadRequest("content is required".into()));
        }
        ContentType::try_from(self.content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            client_msg_id: "c-1".into(),
            content_type: 1,
            content: serde_json::json!({"text": "hi"}),
            reply_to_id: None,
        }
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut req = request();
        assert_eq!(req.validate().unwrap(), ContentType::Text);

        req.client_msg_id = " ".into();
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));

        req.client_msg_id = "x".repeat(65);
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));

        let mut req = request();
        req.content_type = 42;
        assert!(matches!(req.validate(), Err(AppError::BadRequest(_))));

        let mut req = request();
        req.content = serde_json::Value::Null;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_revoke_rules() {
        let req = request();
        let msg = Message::from_request(&req, ContentType::Text, 1);
        let window = Duration::from_secs(120);

        assert!(msg.check_revocable(req.sender_id, msg.created_at, window).is_ok());
        assert!(matches!(
            msg.check_revocable(Uuid::new_v4(), msg.created_at, window),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            msg.check_revocable(
                req.sender_id,
                msg.created_at + chrono::Duration::seconds(121),
                window
            ),
            Err(AppError::RevokeWindowExpired { .. })
        ));

        let mut revoked = msg.clone();
        revoked.status = MessageStatus::Revoked;
        assert!(matches!(
            revoked.check_revocable(req.sender_id, revoked.created_at, window),
            Err(AppError::InvalidState)
        ));
    }

    #[test]
    fn test_status_serializes_as_number() {
        let req = request();
        let msg = Message::from_request(&req, ContentType::Image, 7);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], 1);
        assert_eq!(json["content_type"], 2);
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
