pub mod conversations;
pub mod error;
pub mod middleware;
pub mod users;
pub mod ws;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};

use parley_gateway::Gateway;

/// All HTTP routes: the gateway upgrade plus the authenticated REST surface.
/// Both share the same [`Gateway`], so a REST send fans out to live sockets.
pub fn router(gateway: Gateway) -> Router {
    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::list_messages).post(conversations::send_message),
        )
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route("/users/search", get(users::search_users))
        .layer(from_fn_with_state(gateway.clone(), middleware::require_auth))
        .with_state(gateway.clone());

    let ws_route = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .with_state(gateway);

    Router::new().merge(protected_routes).merge(ws_route)
}
