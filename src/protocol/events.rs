//! Event payload types for the relay protocol
//!
//! All payloads that can be serialized/deserialized within frames.
//! Uses serde for JSON serialization (can be swapped for protobuf/flatbuffers).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version carried in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifier of a verified identity. Opaque to the relay; assigned by the
/// registration service.
pub type IdentityId = String;

/// A room identifier with three shapes: `"global"`, `"group:<id>"` and
/// `"dm:<a>-<b>"` where `a < b` lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// The room every authenticated connection is joined to.
    pub fn global() -> Self {
        RoomId("global".to_string())
    }

    /// An ad-hoc group room.
    pub fn group(id: &str) -> Self {
        RoomId(format!("group:{}", id))
    }

    /// The canonical direct-message room for two identities.
    ///
    /// Commutative under participant swap: either side initiating resolves
    /// to the same id.
    pub fn direct(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        RoomId(format!("dm:{}-{}", lo, hi))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0 == "global"
    }

    pub fn is_direct(&self) -> bool {
        self.0.starts_with("dm:")
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId(s)
    }
}

/// Read-only snapshot of a verified identity, resolved once at handshake
/// time and immutable for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub contact_handle: String,
}

/// Message content classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    System,
}

/// A message as submitted by a session, before the store assigns it an id
/// and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub room_id: RoomId,
    pub sender_id: IdentityId,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Value,
}

/// A persisted message, as broadcast to room members and replayed in
/// history. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: RoomId,
    pub sender_id: IdentityId,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Value,
    /// Milliseconds since UNIX epoch, assigned by the store.
    pub created_at: u64,
}

// =============================================================================
// Control events (0x00 - 0x0F)
// =============================================================================

/// Initial handshake from client, carrying the credential.
///
/// Either field may hold the credential; the connection-scoped cookie
/// equivalent takes precedence over the explicit handshake token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version
    pub version: u32,
    /// Credential from a connection-scoped cookie equivalent
    pub cookie_token: Option<String>,
    /// Credential supplied explicitly at handshake time
    pub auth_token: Option<String>,
}

impl Hello {
    /// The credential to verify, cookie first.
    pub fn credential(&self) -> Option<&str> {
        self.cookie_token.as_deref().or(self.auth_token.as_deref())
    }
}

/// Server announces the connection's own resolved identity id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Me {
    pub identity_id: IdentityId,
}

/// Handshake rejection. The connection is closed after this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailed {
    /// Error code
    pub code: u32,
    /// Human-readable error message
    pub message: String,
}

/// Graceful disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason for disconnect
    pub reason: String,
}

// =============================================================================
// Client -> Server requests (0x10 - 0x2F)
// =============================================================================

/// Join a room and request its history replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoom {
    pub room_id: RoomId,
}

/// Open (or re-open) the canonical DM room with another identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmInitiate {
    pub to_identity_id: IdentityId,
}

/// Send a message to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    pub room_id: RoomId,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default = "empty_metadata")]
    pub metadata: Value,
}

fn empty_metadata() -> Value {
    Value::Object(serde_json::Map::new())
}

// =============================================================================
// Server -> Client events (0x30 - 0x4F)
// =============================================================================

/// History replay for a room, delivered oldest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomHistory {
    pub room_id: RoomId,
    pub messages: Vec<StoredMessage>,
}

/// A newly persisted message, fanned out to every connection joined to the
/// room at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNew {
    pub message: StoredMessage,
}

/// Persistence failure for a send, surfaced to the sender only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageError {
    pub reason: String,
}

/// The live roster: every identity id with at least one open connection,
/// each exactly once, in arbitrary order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub identity_ids: Vec<IdentityId>,
}

/// DM invitation, unicast to every live connection of the target identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmInvited {
    pub from: Identity,
    pub room_id: RoomId,
}

// =============================================================================
// Error (0xFF)
// =============================================================================

/// Generic error event, local to one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: u32,
    pub message: String,
}

impl Error {
    pub fn new(code: u32, message: String) -> Self {
        Self { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dm_room_id_commutative() {
        let a = RoomId::direct("u1", "u2");
        let b = RoomId::direct("u2", "u1");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "dm:u1-u2");
        assert!(a.is_direct());
    }

    #[test]
    fn test_dm_room_id_ordering_is_lexicographic() {
        // "10" < "9" under string ordering
        let room = RoomId::direct("9", "10");
        assert_eq!(room.as_str(), "dm:10-9");
    }

    #[test]
    fn test_room_id_shapes() {
        assert_eq!(RoomId::global().as_str(), "global");
        assert!(RoomId::global().is_global());
        assert_eq!(RoomId::group("lobby").as_str(), "group:lobby");
        assert!(!RoomId::group("lobby").is_direct());
    }

    #[test]
    fn test_hello_credential_cookie_precedence() {
        let hello = Hello {
            version: 1,
            cookie_token: Some("cookie".to_string()),
            auth_token: Some("explicit".to_string()),
        };
        assert_eq!(hello.credential(), Some("cookie"));

        let hello = Hello {
            version: 1,
            cookie_token: None,
            auth_token: Some("explicit".to_string()),
        };
        assert_eq!(hello.credential(), Some("explicit"));

        let hello = Hello {
            version: 1,
            cookie_token: None,
            auth_token: None,
        };
        assert_eq!(hello.credential(), None);
    }

    #[test]
    fn test_send_message_defaults() {
        let msg: SendMessage =
            serde_json::from_str(r#"{"room_id":"global","content":"hi"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.metadata.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_message_kind_wire_format() {
        assert_eq!(serde_json::to_string(&MessageKind::Image).unwrap(), "\"image\"");
        let kind: MessageKind = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(kind, MessageKind::System);
    }
}
