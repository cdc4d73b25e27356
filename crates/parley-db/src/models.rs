//! Database row types. These map directly to SQLite rows.
//! Distinct from parley-types DTOs to keep the DB layer independent.

use chrono::{DateTime, Utc};

use parley_types::models::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub user_low: UserId,
    pub user_high: UserId,
    pub created_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.user_low == user_id || self.user_high == user_id
    }

    /// The other participant, or `None` if `user_id` is not in this conversation.
    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.user_low {
            Some(self.user_high)
        } else if user_id == self.user_high {
            Some(self.user_low)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub attachment_ref: Option<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    /// Whether the recipient's read cursor covers this message.
    pub is_read: bool,
}

pub struct NewMessage<'a> {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: &'a str,
    pub attachment_ref: Option<&'a str>,
    pub is_system: bool,
}

/// Result of marking a conversation read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAdvance {
    /// Cursor position after the operation.
    pub cursor: MessageId,
    /// Messages from the peer whose receipt was recorded by this call, oldest first.
    pub newly_read: Vec<MessageRow>,
}

/// One inbox entry as stored.
#[derive(Debug, Clone)]
pub struct ConversationListing {
    pub conversation: ConversationRow,
    pub peer: UserRow,
    pub last_message: Option<MessageRow>,
    pub cursor: MessageId,
    pub unread_count: u32,
}

impl ConversationListing {
    /// The latest message is newer than the cursor and came from the peer.
    pub fn has_unread(&self, user_id: UserId) -> bool {
        self.last_message
            .as_ref()
            .is_some_and(|m| m.id > self.cursor && m.sender_id != user_id)
    }
}

pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}
