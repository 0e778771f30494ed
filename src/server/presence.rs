//! Online-presence bookkeeping
//!
//! Tracks, for each online identity, the ordered set of live connections.
//! A user with several tabs holds several entries under one identity id;
//! the identity leaves the roster the instant its last connection closes.
//!
//! State is process-lifetime and in-memory only; it rebuilds itself as
//! connections reconnect.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::protocol::events::IdentityId;
use crate::server::ConnectionId;

/// Registry of online identities and their live connections.
///
/// All operations take the single lock once, so concurrent connection
/// workers never observe a partially-updated entry.
#[derive(Default)]
pub struct PresenceRegistry {
    online: RwLock<HashMap<IdentityId, Vec<ConnectionId>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live connection for an identity.
    ///
    /// Re-registering the same pair is a no-op, keeping the set
    /// deduplicated under handshake retries at the transport layer.
    pub async fn register(&self, identity_id: &str, conn_id: &ConnectionId) {
        let mut online = self.online.write().await;
        let conns = online.entry(identity_id.to_string()).or_default();
        if !conns.contains(conn_id) {
            conns.push(conn_id.clone());
        }
    }

    /// Remove a connection; drops the identity entirely when it was the
    /// last one. Safe to call for pairs that were never registered, so
    /// abnormal disconnects during authentication stay harmless.
    pub async fn deregister(&self, identity_id: &str, conn_id: &ConnectionId) {
        let mut online = self.online.write().await;
        if let Some(conns) = online.get_mut(identity_id) {
            conns.retain(|c| c != conn_id);
            if conns.is_empty() {
                online.remove(identity_id);
            }
        }
    }

    /// Every online identity id, each exactly once. Order is arbitrary and
    /// not part of the contract.
    pub async fn roster(&self) -> Vec<IdentityId> {
        let online = self.online.read().await;
        online.keys().cloned().collect()
    }

    /// Live connections of one identity; empty if offline.
    pub async fn connections_of(&self, identity_id: &str) -> Vec<ConnectionId> {
        let online = self.online.read().await;
        online.get(identity_id).cloned().unwrap_or_default()
    }

    /// Whether the identity has at least one live connection
    pub async fn is_online(&self, identity_id: &str) -> bool {
        let online = self.online.read().await;
        online.contains_key(identity_id)
    }

    /// Number of distinct online identities
    pub async fn online_count(&self) -> usize {
        let online = self.online.read().await;
        online.len()
    }
}
