mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_db::Database;
use parley_gateway::{ChatLimits, ChatService, Fanout, Gateway, GatewayConfig, JwtResolver};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    info!("Opened message store at {}", config.db_path.display());

    let limits = ChatLimits {
        max_message_len: config.max_message_len,
        search_limit: config.search_limit,
        ..ChatLimits::default()
    };
    let chat = ChatService::new(db, Fanout::new(), limits);
    let gateway = Gateway::new(
        chat,
        Arc::new(JwtResolver::new(&config.jwt_secret)),
        GatewayConfig {
            heartbeat_interval: config.heartbeat_interval,
            ..GatewayConfig::default()
        },
    );

    let app = parley_api::router(gateway)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
