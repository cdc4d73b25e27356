pub mod api;
pub mod events;
pub mod models;

/// Version of the event frames exchanged over the gateway.
/// Bumped whenever a DTO changes shape incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;
