use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use parley_gateway::ChatError;
use parley_types::api::ErrorBody;

/// REST-facing wrapper so handlers can `?` a [`ChatError`].
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ChatError::Store(e) = &self.0 {
            error!("Store failure: {:#}", e);
        }

        let status = self.status();
        let code = self.0.code();
        let detail = match self.0 {
            ChatError::Store(_) => "store unavailable, retry the request".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            code: code.as_str().to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_chat_errors_to_status_codes() {
        assert_eq!(
            ApiError(ChatError::validation("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(ChatError::NotFound("conversation")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(ChatError::Store(anyhow::anyhow!("database is locked"))).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
