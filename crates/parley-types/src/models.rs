use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform user id. Issued by the identity service, never by this subsystem.
pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
}

/// A persisted message as seen by one of the participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub content: String,
    pub attachment_ref: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    /// True once the recipient's read cursor covers this message.
    pub is_read: bool,
}

/// One row of a user's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub peer: UserSummary,
    pub last_message: Option<MessageDto>,
    pub has_unread: bool,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Seen,
}
