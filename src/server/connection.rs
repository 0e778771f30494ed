//! Per-connection session handling
//!
//! This module binds one network connection to one verified identity and
//! drives the protocol exchange: the authentication handshake, the inbound
//! request loop and the outbound command loop.

use std::sync::Arc;

use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::auth::IdentityVerifier;
use crate::error::{RelayError, Result};
use crate::protocol::codec::{Decodable, Encodable};
use crate::protocol::events::{
    AuthFailed, DmInitiate, DmInvited, Error, Goodbye, Hello, Identity, IdentityId, JoinRoom, Me,
    MessageError, MessageKind, MessageNew, PresenceUpdate, RoomHistory, RoomId, SendMessage,
};
use crate::protocol::frame::{Frame, FrameCodec, FrameType};
use crate::server::ConnectionId;

/// Events emitted by the session to the relay server
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed; the connection is bound to this identity
    Authenticated { identity: Identity },

    /// Client wants to join a room and receive its history
    JoinRoom { room_id: RoomId },

    /// Client wants to open the canonical DM room with another identity
    DmInitiate { to_identity_id: IdentityId },

    /// Client sent a message
    SendMessage {
        room_id: RoomId,
        content: String,
        kind: MessageKind,
        metadata: serde_json::Value,
    },

    /// Transport closed
    Disconnected { reason: String },
}

/// Commands the relay server sends to a session for outbound delivery
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Deliver a history replay
    SendHistory(RoomHistory),

    /// Deliver a newly persisted message
    SendMessage(MessageNew),

    /// Deliver a persistence failure to this sender
    SendMessageError(MessageError),

    /// Deliver the current presence roster
    SendPresence(PresenceUpdate),

    /// Deliver a DM invitation
    SendDmInvited(DmInvited),

    /// Close the connection
    Close(String),
}

/// Session lifecycle. Transitions are one-shot; `Closed` is terminal and a
/// new connection requires a fresh handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Transport established, waiting for Hello
    Connecting,
    /// Credential handed to the identity verifier
    Authenticating,
    /// Session created, servicing requests
    Active,
    /// Terminal
    Closed,
}

/// Per-connection handler driving the session state machine
pub struct ConnectionHandler {
    /// Underlying QUIC connection
    connection: Connection,

    /// Connection id assigned by the relay
    conn_id: ConnectionId,

    /// Identity verifier used during the handshake
    verifier: Arc<dyn IdentityVerifier>,

    /// Session state
    state: RwLock<SessionState>,

    /// Identity snapshot (set once on successful authentication)
    identity: RwLock<Option<Identity>>,

    /// Control stream sender
    control_send: RwLock<Option<SendStream>>,

    /// Channel for sending events to the relay
    event_tx: mpsc::UnboundedSender<SessionEvent>,

    /// Channel for receiving commands from the relay
    command_rx: RwLock<Option<mpsc::UnboundedReceiver<SessionCommand>>>,
}

impl ConnectionHandler {
    pub fn new(
        connection: Connection,
        conn_id: ConnectionId,
        verifier: Arc<dyn IdentityVerifier>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        Self {
            connection,
            conn_id,
            verifier,
            state: RwLock::new(SessionState::Connecting),
            identity: RwLock::new(None),
            control_send: RwLock::new(None),
            event_tx,
            command_rx: RwLock::new(Some(command_rx)),
        }
    }

    /// Get the remote address
    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    /// Get the identity snapshot if authenticated
    pub async fn identity(&self) -> Option<Identity> {
        self.identity.read().await.clone()
    }

    /// Check if the session reached `Active`
    pub async fn is_active(&self) -> bool {
        *self.state.read().await == SessionState::Active
    }

    /// Run the connection handler.
    /// This is the main entry point that should be spawned as a task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.remote_address();
        debug!("New connection {} from {}", self.conn_id, addr);

        let result = self.accept_and_run().await;

        *self.state.write().await = SessionState::Closed;

        let reason = match &result {
            Ok(()) => "normal".to_string(),
            Err(e) => e.to_string(),
        };
        let _ = self.event_tx.send(SessionEvent::Disconnected { reason });

        debug!("Connection {} from {} closed", self.conn_id, addr);
        result
    }

    /// Accept the control stream and run the read/write loops
    async fn accept_and_run(self: &Arc<Self>) -> Result<()> {
        // The client opens the single control stream
        let (send, recv) = self.connection.accept_bi().await.map_err(|e| {
            RelayError::connection(format!("Failed to accept control stream: {}", e))
        })?;

        {
            let mut control = self.control_send.write().await;
            *control = Some(send);
        }

        // Inbound request loop
        let recv_handle = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = h.read_loop(recv).await {
                    debug!("Control stream ended: {}", e);
                }
            })
        };

        // Outbound command loop
        let cmd_handle = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                h.command_loop().await;
            })
        };

        // Either loop ending means the session is over
        tokio::select! {
            _ = recv_handle => {},
            _ = cmd_handle => {},
        }

        Ok(())
    }

    /// Handle incoming frames on the control stream.
    ///
    /// Frames from one connection are decoded and handled strictly in
    /// arrival order.
    async fn read_loop(self: &Arc<Self>, mut recv: RecvStream) -> Result<()> {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    codec.feed(&buf[..n]);

                    // Process all available frames
                    loop {
                        match codec.decode_next() {
                            Ok(Some(frame)) => {
                                if let Err(e) = self.handle_frame(frame).await {
                                    // A bad request is local to this
                                    // connection: report it and keep the
                                    // worker alive.
                                    warn!("Error handling frame on {}: {}", self.conn_id, e);
                                    self.send_error(e).await?;
                                }
                                if *self.state.read().await == SessionState::Closed {
                                    return Ok(());
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                return Err(RelayError::protocol(format!(
                                    "Frame decode error: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!("Control stream finished for {}", self.conn_id);
                    break;
                }
                Err(e) => {
                    return Err(RelayError::network(format!(
                        "Control stream read error: {}",
                        e
                    )));
                }
            }
        }

        Ok(())
    }

    /// Handle a single frame according to the session state
    async fn handle_frame(&self, frame: Frame) -> Result<()> {
        let state = *self.state.read().await;

        match (state, frame.frame_type) {
            // Handshake: Hello carries the credential
            (SessionState::Connecting, FrameType::Hello) => {
                let hello = Hello::decode_frame(&frame)
                    .map_err(|e| RelayError::malformed(format!("Invalid Hello: {}", e)))?;
                self.authenticate(hello).await
            }

            (SessionState::Active, FrameType::JoinRoom) => {
                let join = JoinRoom::decode_frame(&frame)
                    .map_err(|e| RelayError::malformed(format!("Invalid JoinRoom: {}", e)))?;

                let _ = self.event_tx.send(SessionEvent::JoinRoom {
                    room_id: join.room_id,
                });
                Ok(())
            }

            (SessionState::Active, FrameType::DmInitiate) => {
                let dm = DmInitiate::decode_frame(&frame)
                    .map_err(|e| RelayError::malformed(format!("Invalid DmInitiate: {}", e)))?;

                let _ = self.event_tx.send(SessionEvent::DmInitiate {
                    to_identity_id: dm.to_identity_id,
                });
                Ok(())
            }

            (SessionState::Active, FrameType::SendMessage) => {
                let msg = SendMessage::decode_frame(&frame)
                    .map_err(|e| RelayError::malformed(format!("Invalid SendMessage: {}", e)))?;

                let _ = self.event_tx.send(SessionEvent::SendMessage {
                    room_id: msg.room_id,
                    content: msg.content,
                    kind: msg.kind,
                    metadata: msg.metadata,
                });
                Ok(())
            }

            (_, FrameType::Goodbye) => {
                let goodbye = Goodbye::decode_frame(&frame)
                    .map_err(|e| RelayError::malformed(format!("Invalid Goodbye: {}", e)))?;

                debug!("Client {} sent Goodbye: {}", self.conn_id, goodbye.reason);
                *self.state.write().await = SessionState::Closed;
                self.connection.close(0u32.into(), goodbye.reason.as_bytes());
                Ok(())
            }

            // Invalid state/frame combination
            (state, frame_type) => Err(RelayError::protocol(format!(
                "Unexpected frame {:?} in state {:?}",
                frame_type, state
            ))),
        }
    }

    /// Run the one-shot authentication handshake.
    ///
    /// Any failure sends AuthFailed and closes the connection before it
    /// enters the room graph; there is no retry.
    async fn authenticate(&self, hello: Hello) -> Result<()> {
        *self.state.write().await = SessionState::Authenticating;

        // Cookie-equivalent takes precedence over the handshake field
        let verified = match hello.credential() {
            Some(credential) => self.verifier.verify(credential).await,
            None => Err(RelayError::unauthenticated("no credential supplied")),
        };

        match verified {
            Ok(identity) => {
                info!(
                    "Identity {} authenticated on {} from {}",
                    identity.id,
                    self.conn_id,
                    self.remote_address()
                );

                *self.identity.write().await = Some(identity.clone());
                *self.state.write().await = SessionState::Active;

                // Tell the client who it resolved to, before any history or
                // presence traffic arrives
                self.send_frame(&Me {
                    identity_id: identity.id.clone(),
                })
                .await?;

                let _ = self.event_tx.send(SessionEvent::Authenticated { identity });
                Ok(())
            }
            Err(e) => {
                info!("Handshake rejected on {}: {}", self.conn_id, e);

                let failed = AuthFailed {
                    code: e.code(),
                    message: e.message().to_string(),
                };
                // Best effort: the client may already be gone
                let _ = self.send_frame(&failed).await;

                *self.state.write().await = SessionState::Closed;
                self.connection.close(1u32.into(), b"authentication failed");
                Ok(())
            }
        }
    }

    /// Handle commands from the relay server
    async fn command_loop(self: &Arc<Self>) {
        let Some(mut rx) = self.command_rx.write().await.take() else {
            return;
        };

        while let Some(cmd) = rx.recv().await {
            if let Err(e) = self.handle_command(cmd).await {
                warn!("Command delivery error on {}: {}", self.conn_id, e);
            }
        }
    }

    /// Deliver a single command as an outbound frame
    async fn handle_command(&self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::SendHistory(msg) => self.send_frame(&msg).await,
            SessionCommand::SendMessage(msg) => self.send_frame(&msg).await,
            SessionCommand::SendMessageError(msg) => self.send_frame(&msg).await,
            SessionCommand::SendPresence(msg) => self.send_frame(&msg).await,
            SessionCommand::SendDmInvited(msg) => self.send_frame(&msg).await,
            SessionCommand::Close(reason) => {
                *self.state.write().await = SessionState::Closed;
                self.connection.close(0u32.into(), reason.as_bytes());
                Ok(())
            }
        }
    }

    /// Send an event frame on the control stream
    pub(crate) async fn send_frame<T: Encodable>(&self, msg: &T) -> Result<()> {
        let frame = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;

        let mut control = self.control_send.write().await;
        if let Some(send) = control.as_mut() {
            let data = frame.encode_to_bytes();
            send.write_all(&data).await.map_err(|e| {
                RelayError::network(format!("Failed to write to control stream: {}", e))
            })?;
        } else {
            return Err(RelayError::connection("Control stream not open"));
        }

        Ok(())
    }

    /// Send an error frame
    async fn send_error(&self, error: RelayError) -> Result<()> {
        let err = Error::new(error.code(), error.message().to_string());
        self.send_frame(&err).await
    }
}
