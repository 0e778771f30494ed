//! QUIC-based chat relay with JSON event payloads
//!
//! This library provides a real-time chat relay: clients hold one
//! persistent QUIC connection, authenticate once at handshake time, and
//! exchange room messages, presence updates and direct-message invitations
//! over a single control stream.

pub mod auth;
pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;

pub use auth::{IdentityVerifier, StaticTokenVerifier};
pub use client::{ClientEvent, Credentials, RelayClient, RelayClientConfig};
pub use error::{RelayError, Result};
pub use protocol::events::{Identity, IdentityId, MessageKind, RoomId, StoredMessage};
pub use server::{RelayConfig, RelayServer};
pub use store::{MemoryMessageStore, MessageStore};

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique message ID
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
