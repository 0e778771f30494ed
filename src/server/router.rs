//! Room membership tracking
//!
//! This module tracks which connections are joined to which rooms,
//! independent of who is currently connected. Delivery itself goes through
//! the relay's per-connection command channels; the router answers the
//! question "who is in this room right now".

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::protocol::events::RoomId;
use crate::server::ConnectionId;

/// The two views of membership, kept under one lock so every operation is
/// a single critical section and no reader observes the views disagreeing.
#[derive(Default)]
struct MembershipTables {
    /// Room id -> joined connections
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    /// Connection -> joined rooms (for disconnect cleanup)
    joined: HashMap<ConnectionId, HashSet<RoomId>>,
}

/// Per-connection room membership tables.
#[derive(Default)]
pub struct RoomRouter {
    tables: RwLock<MembershipTables>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a room's broadcast group.
    ///
    /// Idempotent: joining an already-joined room is a side-effect-free
    /// success. Returns false if the connection was already a member.
    pub async fn join(&self, conn_id: &ConnectionId, room_id: &RoomId) -> bool {
        let mut tables = self.tables.write().await;
        let newly_joined = tables
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(conn_id.clone());

        if newly_joined {
            tables
                .joined
                .entry(conn_id.clone())
                .or_default()
                .insert(room_id.clone());
        }

        newly_joined
    }

    /// Unsubscribe a connection from one room.
    pub async fn leave(&self, conn_id: &ConnectionId, room_id: &RoomId) {
        let mut tables = self.tables.write().await;

        if let Some(members) = tables.rooms.get_mut(room_id) {
            members.remove(conn_id);
            if members.is_empty() {
                tables.rooms.remove(room_id);
            }
        }

        if let Some(set) = tables.joined.get_mut(conn_id) {
            set.remove(room_id);
            if set.is_empty() {
                tables.joined.remove(conn_id);
            }
        }
    }

    /// Remove a connection from every room (on disconnect). Returns the
    /// rooms it was joined to.
    pub async fn leave_all(&self, conn_id: &ConnectionId) -> Vec<RoomId> {
        let mut tables = self.tables.write().await;

        let room_ids: Vec<RoomId> = tables
            .joined
            .remove(conn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for room_id in &room_ids {
            if let Some(members) = tables.rooms.get_mut(room_id) {
                members.remove(conn_id);
                if members.is_empty() {
                    tables.rooms.remove(room_id);
                }
            }
        }

        room_ids
    }

    /// Snapshot of the connections currently joined to a room. Broadcast
    /// always targets this snapshot at call time, never a cached one.
    pub async fn members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        let tables = self.tables.read().await;
        tables
            .rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a connection is joined to a room
    pub async fn is_member(&self, conn_id: &ConnectionId, room_id: &RoomId) -> bool {
        let tables = self.tables.read().await;
        tables
            .rooms
            .get(room_id)
            .map(|members| members.contains(conn_id))
            .unwrap_or(false)
    }

    /// Rooms a connection is joined to
    pub async fn rooms_of(&self, conn_id: &ConnectionId) -> Vec<RoomId> {
        let tables = self.tables.read().await;
        tables
            .joined
            .get(conn_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one member
    pub async fn room_count(&self) -> usize {
        let tables = self.tables.read().await;
        tables.rooms.len()
    }
}
