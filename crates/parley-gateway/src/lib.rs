pub mod auth;
pub mod bus;
pub mod chat;
pub mod connection;
pub mod error;

pub use auth::{CredentialResolver, Identity, JwtResolver};
pub use bus::Fanout;
pub use chat::{ChatLimits, ChatService};
pub use connection::{Gateway, GatewayConfig};
pub use error::{AuthError, ChatError};
