//! Server-side relay components
//!
//! The relay is split into a per-connection session handler and three
//! shared pieces of state guarded by the [`RelayServer`] coordinator:
//! the presence registry, the room router and the message store.

pub mod connection;
pub mod presence;
pub mod relay;
pub mod router;

/// Opaque per-connection identifier, assigned at accept time
pub type ConnectionId = String;

pub use connection::{ConnectionHandler, SessionCommand, SessionEvent};
pub use presence::PresenceRegistry;
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use router::RoomRouter;
