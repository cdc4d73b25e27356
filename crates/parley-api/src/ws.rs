use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    response::IntoResponse,
};
use serde::Deserialize;

use parley_gateway::Gateway;

use crate::middleware::bearer_token;

/// Subprotocol a browser offers ahead of its token, e.g.
/// `Sec-WebSocket-Protocol: bearer, <token>`.
const BEARER_SUBPROTOCOL: &str = "bearer";

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Upgrade unconditionally and let the gateway authenticate, so a bad
/// credential is reported with a close code instead of an HTTP error.
pub async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let credential = params
        .token
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(&headers).map(str::to_string))
        .or_else(|| subprotocol_token(&headers));

    ws.protocols([BEARER_SUBPROTOCOL])
        .on_upgrade(move |socket| gateway.handle_socket(socket, credential))
}

/// Token that follows `bearer` in the offered subprotocol list.
fn subprotocol_token(headers: &HeaderMap) -> Option<String> {
    let offered = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect::<Vec<_>>();

    offered
        .iter()
        .position(|p| p.eq_ignore_ascii_case(BEARER_SUBPROTOCOL))
        .and_then(|i| offered.get(i + 1))
        .map(|token| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_token_after_bearer_subprotocol() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("bearer, abc.def"),
        );
        assert_eq!(subprotocol_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
        assert_eq!(subprotocol_token(&headers), None);
    }
}
