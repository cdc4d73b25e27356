use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use parley_gateway::Gateway;

use crate::error::ApiError;

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the Bearer credential and attach the caller's `Identity` to the
/// request. The identity is mirrored into the user directory so it can be
/// found and messaged.
pub async fn require_auth(
    State(gateway): State<Gateway>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let token = bearer_token(req.headers()).ok_or_else(|| StatusCode::UNAUTHORIZED.into_response())?;

    let identity = gateway.resolver().resolve(token).map_err(|e| {
        debug!("Rejected request credential: {}", e);
        StatusCode::UNAUTHORIZED.into_response()
    })?;

    gateway
        .chat()
        .register_user(&identity)
        .await
        .map_err(|e| ApiError(e).into_response())?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
