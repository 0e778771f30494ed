//! Relay server implementation
//!
//! The top-level coordinator: accepts QUIC connections, runs the
//! authentication handshake through the per-connection handler, and wires
//! sessions to the presence registry, the room router and the message store.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::auth::IdentityVerifier;
use crate::current_timestamp;
use crate::error::{RelayError, Result};
use crate::protocol::events::{
    DmInvited, Draft, Identity, IdentityId, MessageError, MessageKind, MessageNew, PresenceUpdate,
    RoomHistory, RoomId,
};
use crate::server::connection::{ConnectionHandler, SessionCommand, SessionEvent};
use crate::server::presence::PresenceRegistry;
use crate::server::router::RoomRouter;
use crate::server::ConnectionId;
use crate::store::MessageStore;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// Number of messages replayed on room join
    pub history_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4433".parse().unwrap(),
            max_connections: 10000,
            idle_timeout: Duration::from_secs(300),
            history_limit: 100,
        }
    }
}

/// Active connection tracking
struct ActiveConnection {
    /// Identity snapshot (set after authentication)
    identity: Option<Identity>,
    /// Command channel to this connection's session
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    /// Remote address
    remote_addr: SocketAddr,
    /// Connection time
    connected_at: u64,
}

/// QUIC chat relay server
pub struct RelayServer {
    /// Server configuration
    config: RelayConfig,
    /// QUIC endpoint
    endpoint: Option<Endpoint>,
    /// Online-presence registry
    presence: Arc<PresenceRegistry>,
    /// Room membership router
    router: Arc<RoomRouter>,
    /// Message persistence seam
    store: Arc<dyn MessageStore>,
    /// Credential verification seam
    verifier: Arc<dyn IdentityVerifier>,
    /// Active connections by connection id
    connections: Arc<RwLock<HashMap<ConnectionId, ActiveConnection>>>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn MessageStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            config,
            endpoint: None,
            presence: Arc::new(PresenceRegistry::new()),
            router: Arc::new(RoomRouter::new()),
            store,
            verifier,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the presence registry
    pub fn presence(&self) -> Arc<PresenceRegistry> {
        Arc::clone(&self.presence)
    }

    /// Get the room router
    pub fn router(&self) -> Arc<RoomRouter> {
        Arc::clone(&self.router)
    }

    /// Bind the QUIC endpoint. Returns the bound address (useful when the
    /// configured port is 0).
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        // Generate self-signed certificate for development
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| RelayError::config(format!("Failed to generate certificate: {}", e)))?;

        let cert_der = CertificateDer::from(
            cert.serialize_der()
                .map_err(|e| RelayError::config(format!("Failed to serialize cert: {}", e)))?,
        );
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        // Configure rustls
        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| RelayError::config(format!("Failed to configure TLS: {}", e)))?;

        server_config.alpn_protocols = vec![b"relay".to_vec()];

        // Configure QUIC
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(8u32.into());
        transport_config.max_idle_timeout(Some(
            self.config
                .idle_timeout
                .try_into()
                .map_err(|_| RelayError::config("Idle timeout out of range"))?,
        ));

        let mut quic_server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_config)
                .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?,
        ));
        quic_server_config.transport_config(Arc::new(transport_config));

        // Create endpoint
        let endpoint = Endpoint::server(quic_server_config, self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;

        let local_addr = endpoint.local_addr()?;
        info!("Relay listening on {}", local_addr);

        self.endpoint = Some(endpoint);
        Ok(local_addr)
    }

    /// Bind and serve until the endpoint stops accepting connections
    pub async fn start(&mut self) -> Result<()> {
        self.bind().await?;
        self.run().await
    }

    /// Accept incoming connections on the bound endpoint
    pub async fn run(&self) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| RelayError::config("Server not bound"))?;

        loop {
            match endpoint.accept().await {
                Some(incoming) => {
                    // Check connection limit
                    {
                        let conns = self.connections.read().await;
                        if conns.len() >= self.config.max_connections {
                            warn!("Connection limit reached, rejecting connection");
                            incoming.refuse();
                            continue;
                        }
                    }

                    // Spawn connection handler
                    let server = self.clone_ref();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_incoming(incoming).await {
                            error!("Connection handling failed: {}", e);
                        }
                    });
                }
                None => {
                    warn!("Endpoint stopped accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle an incoming connection
    async fn handle_incoming(&self, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await?;
        let remote_addr = connection.remote_address();
        let conn_id: ConnectionId = uuid::Uuid::new_v4().to_string();

        debug!("New connection {} from {}", conn_id, remote_addr);

        // Create channels for this connection
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // Register connection (before auth, so we can track it)
        {
            let mut conns = self.connections.write().await;
            conns.insert(
                conn_id.clone(),
                ActiveConnection {
                    identity: None,
                    command_tx: command_tx.clone(),
                    remote_addr,
                    connected_at: current_timestamp(),
                },
            );
        }

        // Create connection handler
        let handler = Arc::new(ConnectionHandler::new(
            connection,
            conn_id.clone(),
            Arc::clone(&self.verifier),
            event_tx,
            command_rx,
        ));

        // Spawn handler task
        let handler_task = tokio::spawn(handler.run());

        // The event processor owns teardown: it drains the session's queue
        // in arrival order, so cleanup never overtakes an earlier event
        // from the same connection.
        let conn_id_clone = conn_id.clone();
        let server = self.clone_ref();
        tokio::spawn(async move {
            server.process_events(conn_id_clone, event_rx).await;
        });

        if let Ok(Err(e)) = handler_task.await {
            debug!("Handler ended with error: {}", e);
        }

        Ok(())
    }

    /// Process events from one connection's session, in arrival order
    async fn process_events(
        &self,
        conn_id: ConnectionId,
        mut event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = self.handle_event(&conn_id, event).await {
                // Failures stay local to this session
                warn!("Event handling error for {}: {}", conn_id, e);
            }
        }

        // The handler dropped its sender without a Disconnected event;
        // teardown is idempotent, so a second pass is harmless.
        self.cleanup_connection(&conn_id).await;
    }

    /// Handle a single session event
    async fn handle_event(&self, conn_id: &ConnectionId, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Authenticated { identity } => {
                self.handle_authenticated(conn_id, identity).await?;
            }

            SessionEvent::JoinRoom { room_id } => {
                self.handle_join_room(conn_id, room_id).await?;
            }

            SessionEvent::DmInitiate { to_identity_id } => {
                self.handle_dm_initiate(conn_id, to_identity_id).await?;
            }

            SessionEvent::SendMessage {
                room_id,
                content,
                kind,
                metadata,
            } => {
                self.handle_send_message(conn_id, room_id, content, kind, metadata)
                    .await?;
            }

            SessionEvent::Disconnected { reason } => {
                debug!("Connection {} disconnected: {}", conn_id, reason);
                // Ordered after every earlier event from this connection,
                // so no queued request can resurrect its state
                self.cleanup_connection(conn_id).await;
            }
        }

        Ok(())
    }

    /// Wire an authenticated session into the room graph: presence, the
    /// global room, history replay and a roster broadcast.
    async fn handle_authenticated(&self, conn_id: &ConnectionId, identity: Identity) -> Result<()> {
        // Update connection with the identity snapshot. A connection
        // already torn down must not enter the room graph.
        {
            let mut conns = self.connections.write().await;
            match conns.get_mut(conn_id) {
                Some(conn) => conn.identity = Some(identity.clone()),
                None => {
                    debug!(
                        "Dropping authentication of {} for closed connection {}",
                        identity.id, conn_id
                    );
                    return Ok(());
                }
            }
        }

        info!("Identity {} online on connection {}", identity.id, conn_id);

        self.presence.register(&identity.id, conn_id).await;

        // Auto-join the global room and replay its history
        self.router.join(conn_id, &RoomId::global()).await;
        self.replay_history(conn_id, RoomId::global()).await?;

        // Everyone sees the updated roster
        self.broadcast_presence().await;

        Ok(())
    }

    /// Handle a room join: subscribe and replay history to the requester
    async fn handle_join_room(&self, conn_id: &ConnectionId, room_id: RoomId) -> Result<()> {
        {
            let conns = self.connections.read().await;
            if !conns.contains_key(conn_id) {
                debug!("Dropping join from closed connection {}", conn_id);
                return Ok(());
            }
        }

        self.router.join(conn_id, &room_id).await;
        debug!("Connection {} joined room {}", conn_id, room_id);

        self.replay_history(conn_id, room_id).await
    }

    /// Handle a DM initiation: derive the canonical room, join it, replay
    /// history, and invite every live connection of the target identity.
    async fn handle_dm_initiate(
        &self,
        conn_id: &ConnectionId,
        to_identity_id: IdentityId,
    ) -> Result<()> {
        let inviter = {
            let conns = self.connections.read().await;
            conns.get(conn_id).and_then(|c| c.identity.clone())
        };

        let Some(inviter) = inviter else {
            // Only active sessions emit requests; tolerate a race with
            // disconnect cleanup.
            warn!("DM initiate from unauthenticated connection {}", conn_id);
            return Ok(());
        };

        let room_id = RoomId::direct(&inviter.id, &to_identity_id);

        self.router.join(conn_id, &room_id).await;
        self.replay_history(conn_id, room_id.clone()).await?;

        // Invitation goes to every live connection of the target; if the
        // target is offline it is dropped, not queued.
        let invited = DmInvited {
            from: inviter,
            room_id,
        };
        for target_conn in self.presence.connections_of(&to_identity_id).await {
            self.send_to_connection(&target_conn, SessionCommand::SendDmInvited(invited.clone()))
                .await?;
        }

        Ok(())
    }

    /// Handle a message send: persist, then fan out the stored form to the
    /// room's current membership, sender included.
    async fn handle_send_message(
        &self,
        conn_id: &ConnectionId,
        room_id: RoomId,
        content: String,
        kind: MessageKind,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let sender_id = {
            let conns = self.connections.read().await;
            conns
                .get(conn_id)
                .and_then(|c| c.identity.as_ref().map(|i| i.id.clone()))
        };

        let Some(sender_id) = sender_id else {
            warn!("Message send from unauthenticated connection {}", conn_id);
            return Ok(());
        };

        let draft = Draft {
            room_id: room_id.clone(),
            sender_id: sender_id.clone(),
            content,
            kind,
            metadata,
        };

        match self.store.append(draft).await {
            Ok(stored) => {
                debug!(
                    "Message {} from {} in room {}",
                    stored.id, sender_id, room_id
                );

                // Membership snapshot at send time; includes the sender if
                // joined, and nobody else.
                for member in self.router.members(&room_id).await {
                    self.send_to_connection(
                        &member,
                        SessionCommand::SendMessage(MessageNew {
                            message: stored.clone(),
                        }),
                    )
                    .await?;
                }
            }
            Err(e) => {
                warn!("Message persistence failed for {}: {}", conn_id, e);

                // Surfaced to the sender only; the session stays active
                self.send_to_connection(
                    conn_id,
                    SessionCommand::SendMessageError(MessageError {
                        reason: e.to_string(),
                    }),
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Fetch and deliver a room's recent history to one connection,
    /// oldest-first. A store failure degrades to an empty replay rather
    /// than failing the join.
    async fn replay_history(&self, conn_id: &ConnectionId, room_id: RoomId) -> Result<()> {
        let mut messages = match self
            .store
            .fetch_recent(&room_id, self.config.history_limit)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!("History fetch failed for room {}: {}", room_id, e);
                Vec::new()
            }
        };

        // Store-native order is newest-first; replay chronologically
        messages.reverse();

        self.send_to_connection(
            conn_id,
            SessionCommand::SendHistory(RoomHistory { room_id, messages }),
        )
        .await
    }

    /// Broadcast the presence roster to every authenticated connection
    async fn broadcast_presence(&self) {
        let update = PresenceUpdate {
            identity_ids: self.presence.roster().await,
        };

        let conns = self.connections.read().await;
        for conn in conns.values().filter(|c| c.identity.is_some()) {
            let _ = conn
                .command_tx
                .send(SessionCommand::SendPresence(update.clone()));
        }
    }

    /// Send a command to a specific connection
    async fn send_to_connection(&self, conn_id: &ConnectionId, cmd: SessionCommand) -> Result<()> {
        let conns = self.connections.read().await;
        if let Some(conn) = conns.get(conn_id) {
            let _ = conn.command_tx.send(cmd);
        }
        Ok(())
    }

    /// Clean up a disconnected connection
    async fn cleanup_connection(&self, conn_id: &ConnectionId) {
        let removed = {
            let mut conns = self.connections.write().await;
            conns.remove(conn_id)
        };

        self.router.leave_all(conn_id).await;

        if let Some(conn) = removed {
            let uptime_ms = current_timestamp().saturating_sub(conn.connected_at);
            debug!(
                "Connection {} from {} closed after {} ms",
                conn_id, conn.remote_addr, uptime_ms
            );

            if let Some(identity) = conn.identity {
                self.presence.deregister(&identity.id, conn_id).await;
                self.broadcast_presence().await;
                info!("Identity {} left connection {}", identity.id, conn_id);
            }
        }
    }

    /// Get server statistics
    pub async fn stats(&self) -> RelayStats {
        let conns = self.connections.read().await;
        let authenticated = conns.values().filter(|c| c.identity.is_some()).count();

        RelayStats {
            total_connections: conns.len(),
            authenticated_connections: authenticated,
            online_identities: self.presence.online_count().await,
            active_rooms: self.router.room_count().await,
            bind_address: self.config.bind_addr,
        }
    }

    /// Shutdown the server
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(endpoint) = self.endpoint.take() {
            let conns = self.connections.read().await;
            for conn in conns.values() {
                let _ = conn
                    .command_tx
                    .send(SessionCommand::Close("Server shutdown".to_string()));
            }

            endpoint.close(0u32.into(), b"Server shutdown");
            info!("Relay shutdown complete");
        }
        Ok(())
    }

    /// Clone reference for spawning tasks
    pub fn clone_ref(&self) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            endpoint: self.endpoint.clone(),
            presence: Arc::clone(&self.presence),
            router: Arc::clone(&self.router),
            store: Arc::clone(&self.store),
            verifier: Arc::clone(&self.verifier),
            connections: Arc::clone(&self.connections),
        })
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub online_identities: usize,
    pub active_rooms: usize,
    pub bind_address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::store::{MemoryMessageStore, MessageStore};
    use async_trait::async_trait;

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            display_name: format!("{}-name", id),
            contact_handle: format!("{}@example.com", id),
        }
    }

    fn test_server(store: Arc<dyn MessageStore>) -> RelayServer {
        RelayServer::new(
            RelayConfig::default(),
            store,
            Arc::new(StaticTokenVerifier::new()),
        )
    }

    /// Register a fake connection directly, returning its command receiver
    async fn add_connection(
        server: &RelayServer,
        conn_id: &str,
    ) -> mpsc::UnboundedReceiver<SessionCommand> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mut conns = server.connections.write().await;
        conns.insert(
            conn_id.to_string(),
            ActiveConnection {
                identity: None,
                command_tx,
                remote_addr: "127.0.0.1:0".parse().unwrap(),
                connected_at: current_timestamp(),
            },
        );
        command_rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    /// A store whose append always fails
    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _draft: Draft) -> Result<crate::protocol::events::StoredMessage> {
            Err(RelayError::store_unavailable("backend down"))
        }

        async fn fetch_recent(
            &self,
            _room_id: &RoomId,
            _limit: usize,
        ) -> Result<Vec<crate::protocol::events::StoredMessage>> {
            Err(RelayError::store_unavailable("backend down"))
        }
    }

    #[tokio::test]
    async fn test_authenticated_wires_presence_and_global_room() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx = add_connection(&server, "c1").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();

        assert!(server.presence.is_online("u1").await);
        assert!(
            server
                .router
                .is_member(&"c1".to_string(), &RoomId::global())
                .await
        );

        let cmds = drain(&mut rx);
        assert!(matches!(
            &cmds[0],
            SessionCommand::SendHistory(h) if h.room_id.is_global() && h.messages.is_empty()
        ));
        assert!(matches!(
            &cmds[1],
            SessionCommand::SendPresence(p) if p.identity_ids == vec!["u1".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_broadcast_targets_current_membership_only() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;
        let mut rx3 = add_connection(&server, "c3").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        server
            .handle_authenticated(&"c2".to_string(), identity("u2"))
            .await
            .unwrap();
        server
            .handle_authenticated(&"c3".to_string(), identity("u3"))
            .await
            .unwrap();

        // c1 and c2 join a group room; c3 stays out
        let room = RoomId::group("g1");
        server
            .handle_join_room(&"c1".to_string(), room.clone())
            .await
            .unwrap();
        server
            .handle_join_room(&"c2".to_string(), room.clone())
            .await
            .unwrap();

        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        server
            .handle_send_message(
                &"c1".to_string(),
                room,
                "hi".to_string(),
                MessageKind::Text,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        // Sender and fellow member both receive it
        for rx in [&mut rx1, &mut rx2] {
            let cmds = drain(rx);
            assert_eq!(cmds.len(), 1);
            assert!(matches!(
                &cmds[0],
                SessionCommand::SendMessage(m)
                    if m.message.content == "hi" && m.message.sender_id == "u1"
            ));
        }

        // Non-member receives nothing
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn test_send_without_join_persists_but_broadcasts_to_members_only() {
        let store = Arc::new(MemoryMessageStore::new());
        let server = test_server(store.clone());
        let mut rx1 = add_connection(&server, "c1").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        drain(&mut rx1);

        // u1 never joined this room
        let room = RoomId::group("silent");
        server
            .handle_send_message(
                &"c1".to_string(),
                room.clone(),
                "into the void".to_string(),
                MessageKind::Text,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        // Persisted...
        let stored = store.fetch_recent(&room, 10).await.unwrap();
        assert_eq!(stored.len(), 1);

        // ...but delivered to nobody, not even the sender
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_to_sender_only() {
        let server = test_server(Arc::new(FailingStore));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        server
            .handle_authenticated(&"c2".to_string(), identity("u2"))
            .await
            .unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        server
            .handle_send_message(
                &"c1".to_string(),
                RoomId::global(),
                "hi".to_string(),
                MessageKind::Text,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let cmds = drain(&mut rx1);
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], SessionCommand::SendMessageError(_)));

        // Other member of global sees nothing
        assert!(drain(&mut rx2).is_empty());

        // Session still active: membership untouched
        assert!(
            server
                .router
                .is_member(&"c1".to_string(), &RoomId::global())
                .await
        );
    }

    #[tokio::test]
    async fn test_dm_initiate_invites_every_target_session() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2a = add_connection(&server, "c2a").await;
        let mut rx2b = add_connection(&server, "c2b").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        // u2 has two tabs open
        server
            .handle_authenticated(&"c2a".to_string(), identity("u2"))
            .await
            .unwrap();
        server
            .handle_authenticated(&"c2b".to_string(), identity("u2"))
            .await
            .unwrap();
        drain(&mut rx1);
        drain(&mut rx2a);
        drain(&mut rx2b);

        server
            .handle_dm_initiate(&"c1".to_string(), "u2".to_string())
            .await
            .unwrap();

        // Initiator joined the canonical room and got its (empty) history
        let dm_room = RoomId::direct("u1", "u2");
        assert!(server.router.is_member(&"c1".to_string(), &dm_room).await);
        let cmds = drain(&mut rx1);
        assert!(matches!(
            &cmds[0],
            SessionCommand::SendHistory(h) if h.room_id == dm_room
        ));

        // Both of the target's sessions were invited
        for rx in [&mut rx2a, &mut rx2b] {
            let cmds = drain(rx);
            assert_eq!(cmds.len(), 1);
            assert!(matches!(
                &cmds[0],
                SessionCommand::SendDmInvited(inv)
                    if inv.room_id == dm_room && inv.from.id == "u1"
            ));
        }
    }

    #[tokio::test]
    async fn test_dm_initiate_to_offline_target_is_dropped() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        drain(&mut rx1);

        server
            .handle_dm_initiate(&"c1".to_string(), "offline-user".to_string())
            .await
            .unwrap();

        // Initiator still joins and gets history; no invitation anywhere
        let cmds = drain(&mut rx1);
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], SessionCommand::SendHistory(_)));
    }

    #[tokio::test]
    async fn test_cleanup_updates_presence_and_rebroadcasts() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        server
            .handle_authenticated(&"c2".to_string(), identity("u2"))
            .await
            .unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        server.cleanup_connection(&"c1".to_string()).await;

        assert!(!server.presence.is_online("u1").await);
        assert!(server.presence.is_online("u2").await);
        assert!(
            !server
                .router
                .is_member(&"c1".to_string(), &RoomId::global())
                .await
        );

        // Remaining connection sees the shrunken roster
        let cmds = drain(&mut rx2);
        assert_eq!(cmds.len(), 1);
        assert!(matches!(
            &cmds[0],
            SessionCommand::SendPresence(p) if p.identity_ids == vec!["u2".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_events_after_teardown_do_not_resurrect_state() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx = add_connection(&server, "c1").await;

        // Teardown first, then the events that were still queued when the
        // connection dropped
        server.cleanup_connection(&"c1".to_string()).await;
        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        server
            .handle_join_room(&"c1".to_string(), RoomId::group("g1"))
            .await
            .unwrap();

        // No ghost presence entry and no router membership survives
        assert!(!server.presence.is_online("u1").await);
        assert_eq!(server.presence.online_count().await, 0);
        assert!(
            !server
                .router
                .is_member(&"c1".to_string(), &RoomId::global())
                .await
        );
        assert_eq!(server.router.room_count().await, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_event_runs_teardown_in_order() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;

        server
            .handle_authenticated(&"c1".to_string(), identity("u1"))
            .await
            .unwrap();
        server
            .handle_authenticated(&"c2".to_string(), identity("u2"))
            .await
            .unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        // Teardown rides the event queue, strictly after the events above
        server
            .handle_event(
                &"c1".to_string(),
                SessionEvent::Disconnected {
                    reason: "gone".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(!server.presence.is_online("u1").await);
        assert!(
            !server
                .router
                .is_member(&"c1".to_string(), &RoomId::global())
                .await
        );

        let cmds = drain(&mut rx2);
        assert_eq!(cmds.len(), 1);
        assert!(matches!(
            &cmds[0],
            SessionCommand::SendPresence(p) if p.identity_ids == vec!["u2".to_string()]
        ));

        // A second teardown pass (channel close fallback) is a no-op
        server.cleanup_connection(&"c1".to_string()).await;
        assert!(server.presence.is_online("u2").await);
    }

    #[tokio::test]
    async fn test_cleanup_of_unauthenticated_connection_is_harmless() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let _rx = add_connection(&server, "c1").await;

        // Disconnect before the handshake completed
        server.cleanup_connection(&"c1".to_string()).await;

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.online_identities, 0);
    }

    #[tokio::test]
    async fn test_history_replay_is_chronological_and_capped() {
        let store = Arc::new(MemoryMessageStore::new());
        let room = RoomId::group("g1");

        for i in 0..5 {
            store
                .append(Draft {
                    room_id: room.clone(),
                    sender_id: "u1".to_string(),
                    content: format!("m{}", i),
                    kind: MessageKind::Text,
                    metadata: serde_json::json!({}),
                })
                .await
                .unwrap();
        }

        let mut config = RelayConfig::default();
        config.history_limit = 3;
        let server = RelayServer::new(config, store, Arc::new(StaticTokenVerifier::new()));
        let mut rx = add_connection(&server, "c1").await;

        server
            .replay_history(&"c1".to_string(), room.clone())
            .await
            .unwrap();

        let cmds = drain(&mut rx);
        let SessionCommand::SendHistory(history) = &cmds[0] else {
            panic!("expected history");
        };
        assert_eq!(history.room_id, room);
        // Last 3 messages, oldest-first
        let contents: Vec<_> = history.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_history_fetch_failure_degrades_to_empty() {
        let server = test_server(Arc::new(FailingStore));
        let mut rx = add_connection(&server, "c1").await;

        server
            .replay_history(&"c1".to_string(), RoomId::global())
            .await
            .unwrap();

        let cmds = drain(&mut rx);
        assert!(matches!(
            &cmds[0],
            SessionCommand::SendHistory(h) if h.messages.is_empty()
        ));
    }
}
