use serde::{Deserialize, Serialize};

use crate::models::{
    ConversationId, ConversationSummary, DeliveryStatus, MessageDto, MessageId, UserId,
    UserSummary,
};

/// Events sent FROM client TO server over the gateway.
/// Envelope is `{"type": "...", ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Post a message. Addressed by conversation, or by peer when the
    /// conversation may not exist yet.
    Send {
        conversation_id: Option<ConversationId>,
        peer_id: Option<UserId>,
        #[serde(default)]
        content: String,
        attachment_ref: Option<String>,
    },

    /// Ephemeral typing indicator, never persisted
    Typing {
        peer_id: Option<UserId>,
        conversation_id: Option<ConversationId>,
        is_typing: bool,
    },

    /// Advance the caller's read cursor to the latest message
    Read { conversation_id: ConversationId },

    /// Acknowledge that a message reached this client
    Delivered { message_id: MessageId },

    SearchUser { keyword: String },

    StartConversation { peer_id: UserId },

    ListConversations,

    ListMessages {
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: Option<u32>,
    },

    /// Any `type` this server does not know about
    #[serde(other)]
    Unknown,
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted
    Ready {
        user_id: UserId,
        username: String,
        protocol_version: u32,
    },

    /// A message was persisted in one of the user's conversations
    Message { message: MessageDto },

    Typing {
        conversation_id: Option<ConversationId>,
        user_id: UserId,
        is_typing: bool,
    },

    /// Delivery/read state of a message this user sent
    MessageStatus {
        message_id: MessageId,
        conversation_id: ConversationId,
        status: DeliveryStatus,
        /// The participant who received or read the message
        user_id: UserId,
    },

    SearchResults { users: Vec<UserSummary> },

    ConversationStarted { conversation: ConversationSummary },

    Conversations { conversations: Vec<ConversationSummary> },

    Messages {
        conversation_id: ConversationId,
        messages: Vec<MessageDto>,
    },

    /// A counterparty came online or went offline
    Presence { user_id: UserId, online: bool },

    Error { code: ErrorCode, detail: String },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error {
            code,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    StoreUnavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::NotFound => "not_found",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

/// WebSocket close codes used by the gateway.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL: u16 = 1011;
    pub const AUTH_FAILED: u16 = 4001;
    pub const MALFORMED_FRAME: u16 = 4400;
}

/// Why an inbound text frame could not become a [`ClientEvent`].
#[derive(Debug)]
pub enum FrameError {
    /// Not a JSON object carrying a string `type`. Fatal for the connection.
    Malformed(String),
    /// Known `type`, but the payload does not fit it.
    InvalidPayload { kind: String, reason: String },
}

/// A parsed inbound frame, keeping the raw `type` for logging unknown events.
#[derive(Debug)]
pub struct ClientFrame {
    pub kind: String,
    pub event: ClientEvent,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(serde_json::Value::String(kind)) => kind.clone(),
            Some(_) => return Err(FrameError::Malformed("`type` must be a string".into())),
            None if value.is_object() => {
                return Err(FrameError::Malformed("missing `type`".into()));
            }
            None => return Err(FrameError::Malformed("frame is not a JSON object".into())),
        };

        let event = serde_json::from_value::<ClientEvent>(value).map_err(|e| {
            FrameError::InvalidPayload {
                kind: kind.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self { kind, event })
    }
}
