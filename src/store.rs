//! Message store seam
//!
//! The relay reaches persistence only through the narrow [`MessageStore`]
//! interface: append one message, fetch the last N for a room. The bundled
//! [`MemoryMessageStore`] backs the standalone server, demos and tests; a
//! durable backend plugs in behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::{current_timestamp, generate_message_id};
use crate::protocol::events::{Draft, RoomId, StoredMessage};

/// Append-only persistence keyed by room id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a draft, assigning it an id and creation timestamp.
    async fn append(&self, draft: Draft) -> Result<StoredMessage>;

    /// Fetch up to `limit` messages for a room, newest-first.
    ///
    /// An empty vec is a valid answer for an unknown room.
    async fn fetch_recent(&self, room_id: &RoomId, limit: usize) -> Result<Vec<StoredMessage>>;
}

/// In-memory message store, process-lifetime only.
#[derive(Default)]
pub struct MemoryMessageStore {
    rooms: RwLock<HashMap<RoomId, Vec<StoredMessage>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total messages across all rooms
    pub async fn len(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().map(|msgs| msgs.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, draft: Draft) -> Result<StoredMessage> {
        let stored = StoredMessage {
            id: generate_message_id(),
            room_id: draft.room_id.clone(),
            sender_id: draft.sender_id,
            content: draft.content,
            kind: draft.kind,
            metadata: draft.metadata,
            created_at: current_timestamp(),
        };

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(draft.room_id)
            .or_default()
            .push(stored.clone());

        Ok(stored)
    }

    async fn fetch_recent(&self, room_id: &RoomId, limit: usize) -> Result<Vec<StoredMessage>> {
        let rooms = self.rooms.read().await;
        let messages = rooms
            .get(room_id)
            .map(|msgs| msgs.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(messages)
    }
}
