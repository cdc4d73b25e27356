use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use parley_gateway::chat::Addressee;
use parley_gateway::{Gateway, Identity};
use parley_types::api::{MarkReadResponse, MessageQuery, SendMessageRequest, StartConversationRequest};
use parley_types::models::ConversationId;

use crate::error::ApiError;

pub async fn list_conversations(
    State(gateway): State<Gateway>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = gateway.chat().list_conversations(identity.user_id).await?;
    Ok(Json(conversations))
}

/// Find or create the conversation with `peer_id`. Idempotent.
pub async fn start_conversation(
    State(gateway): State<Gateway>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = gateway
        .chat()
        .start_conversation(identity.user_id, req.peer_id)
        .await?;
    Ok(Json(conversation))
}

pub async fn list_messages(
    State(gateway): State<Gateway>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<MessageQuery>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = gateway
        .chat()
        .list_messages(identity.user_id, conversation_id, query.before, query.limit)
        .await?;
    Ok(Json(messages))
}

/// Same path as a gateway `send`: persisted, then pushed to both participants.
pub async fn send_message(
    State(gateway): State<Gateway>,
    Path(conversation_id): Path<ConversationId>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = gateway
        .chat()
        .send(
            identity.user_id,
            Addressee::Conversation(conversation_id),
            &req.content,
            req.attachment_ref.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn mark_read(
    State(gateway): State<Gateway>,
    Path(conversation_id): Path<ConversationId>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = gateway
        .chat()
        .mark_read(identity.user_id, conversation_id)
        .await?;
    Ok(Json(MarkReadResponse {
        conversation_id: outcome.conversation_id,
        newly_read: outcome.newly_read,
    }))
}
