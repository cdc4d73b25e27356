#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header, encode};

use parley_db::Database;
use parley_gateway::auth::Claims;
use parley_gateway::{ChatLimits, ChatService, Fanout, Gateway, GatewayConfig, Identity, JwtResolver};

pub const SECRET: &str = "test-secret";

pub fn gateway() -> Gateway {
    gateway_with_store().0
}

/// Gateway plus a handle on its store, for tests that tamper with it.
pub fn gateway_with_store() -> (Gateway, Arc<Database>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let chat = ChatService::new(db.clone(), Fanout::new(), ChatLimits::default());
    let config = GatewayConfig {
        heartbeat_interval: Duration::from_secs(30),
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(chat, Arc::new(JwtResolver::new(SECRET)), config);
    (gateway, db)
}

pub fn identity(user_id: i64, username: &str) -> Identity {
    Identity {
        user_id,
        username: username.to_string(),
    }
}

pub fn token(user_id: i64, username: &str) -> String {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}
