use parley_types::events::{ErrorCode, ServerEvent};
use thiserror::Error;

/// Failures of a single chat operation. None of these close the connection;
/// they are reported to the originating client only.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Store unavailable or failed. Never retried here: the client resubmits.
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation(detail.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Store(_) => ErrorCode::StoreUnavailable,
        }
    }

    /// Client-facing error frame. Store internals stay in the logs.
    pub fn to_event(&self) -> ServerEvent {
        let detail = match self {
            Self::Store(_) => "store unavailable, retry the request".to_string(),
            other => other.to_string(),
        };
        ServerEvent::error(self.code(), detail)
    }
}

/// Credential could not be turned into an identity. Always fatal for the connection.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("invalid credential: {0}")]
    Invalid(String),
}
