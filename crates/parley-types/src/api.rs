//! Request and response bodies for the REST surface.

use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, MessageId, UserId};

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub peer_id: UserId,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    pub attachment_ref: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MessageQuery {
    /// Only return messages older than this id.
    pub before: Option<MessageId>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub keyword: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MarkReadResponse {
    pub conversation_id: ConversationId,
    pub newly_read: Vec<MessageId>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub detail: String,
}
