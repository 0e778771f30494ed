//! QUIC-based relay client implementation
//!
//! This module provides a client for connecting to the relay server,
//! running the authentication handshake, and exchanging events over the
//! single control stream.

use crate::error::{RelayError, Result};
use crate::protocol::codec::{Decodable, Encodable};
use crate::protocol::events::{
    AuthFailed, DmInitiate, DmInvited, Error, Goodbye, Hello, JoinRoom, Me, MessageError,
    MessageKind, MessageNew, PresenceUpdate, RoomHistory, RoomId, SendMessage,
};
use crate::protocol::frame::{Frame, FrameCodec, FrameType};
use crate::protocol::PROTOCOL_VERSION;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Relay client configuration
#[derive(Clone, Debug)]
pub struct RelayClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Client bind address (use 0.0.0.0:0 for auto)
    pub bind_addr: SocketAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:4433".parse().unwrap(),
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            connect_timeout_secs: 10,
        }
    }
}

/// Credentials presented during the handshake.
///
/// When both are set the cookie token wins, matching the server's
/// precedence rule.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub cookie_token: Option<String>,
    pub auth_token: Option<String>,
}

impl Credentials {
    /// Credential carried in the handshake payload
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            cookie_token: None,
            auth_token: Some(token.into()),
        }
    }

    /// Credential carried as the session cookie equivalent
    pub fn cookie(token: impl Into<String>) -> Self {
        Self {
            cookie_token: Some(token.into()),
            auth_token: None,
        }
    }
}

/// Events the client surfaces from the server
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake accepted; carries our resolved identity id
    Me(Me),
    /// Handshake rejected; the connection is closed
    AuthFailed(AuthFailed),
    /// History replay after a join
    RoomHistory(RoomHistory),
    /// A message was delivered to a room we are in
    MessageNew(MessageNew),
    /// Our own send failed to persist
    MessageError(MessageError),
    /// The online roster changed
    PresenceUpdate(PresenceUpdate),
    /// Someone opened a DM room with us
    DmInvited(DmInvited),
    /// Server-reported request error
    ServerError(Error),
    /// Transport closed
    Disconnected(String),
}

/// QUIC-based relay client
pub struct RelayClient {
    config: RelayClientConfig,
    connection: Option<Connection>,
    endpoint: Option<Endpoint>,
    control_send: Option<Arc<Mutex<SendStream>>>,
}

impl RelayClient {
    /// Create a new relay client with the given configuration
    pub fn new(config: RelayClientConfig) -> Self {
        Self {
            config,
            connection: None,
            endpoint: None,
            control_send: None,
        }
    }

    /// Connect to the relay and start the handshake.
    ///
    /// The handshake outcome arrives on the returned channel as either
    /// `Me` or `AuthFailed`.
    pub async fn connect(
        &mut self,
        credentials: Credentials,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        info!("Connecting to relay at {}", self.config.server_addr);

        let client_config = self.configure_client()?;

        let mut endpoint = Endpoint::client(self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;

        endpoint.set_default_client_config(client_config);
        self.endpoint = Some(endpoint.clone());

        let connecting = endpoint
            .connect(self.config.server_addr, "localhost")
            .map_err(|e| RelayError::connection(format!("Failed to initiate connection: {}", e)))?;

        let connection = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.connect_timeout_secs),
            connecting,
        )
        .await
        .map_err(|_| RelayError::timeout("Connection timeout"))?
        .map_err(|e| RelayError::connection(format!("Failed to connect: {}", e)))?;

        self.connection = Some(connection.clone());

        // Open the control stream and say hello
        let (mut send, recv) = connection.open_bi().await?;

        let hello = Hello {
            version: PROTOCOL_VERSION,
            cookie_token: credentials.cookie_token,
            auth_token: credentials.auth_token,
        };
        let frame = hello
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode Hello: {}", e)))?;
        send.write_all(&frame.encode_to_bytes()).await?;

        self.control_send = Some(Arc::new(Mutex::new(send)));

        // Surface server events on a channel
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self::start_event_receiver(recv, event_tx);

        Ok(event_rx)
    }

    /// Configure the QUIC client
    fn configure_client(&self) -> Result<QuinnClientConfig> {
        // Create a custom certificate verifier that accepts self-signed certificates
        // WARNING: This is insecure and should only be used for development/testing
        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();

        // Set ALPN protocol to match server
        crypto.alpn_protocols = vec![b"relay".to_vec()];

        Ok(QuinnClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?,
        )))
    }

    /// Read frames off the control stream and decode them into events
    fn start_event_receiver(
        mut recv: quinn::RecvStream,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) {
        tokio::spawn(async move {
            let mut codec = FrameCodec::new();
            let mut buf = vec![0u8; 4096];

            loop {
                match recv.read(&mut buf).await {
                    Ok(Some(n)) => {
                        codec.feed(&buf[..n]);

                        loop {
                            match codec.decode_next() {
                                Ok(Some(frame)) => {
                                    match Self::frame_to_event(frame) {
                                        Ok(event) => {
                                            let _ = event_tx.send(event);
                                        }
                                        Err(e) => {
                                            error!("Failed to decode server event: {}", e);
                                        }
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    error!("Frame decode error: {}", e);
                                    let _ = event_tx.send(ClientEvent::Disconnected(format!(
                                        "Protocol error: {}",
                                        e
                                    )));
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("Control stream finished");
                        let _ = event_tx
                            .send(ClientEvent::Disconnected("Stream finished".to_string()));
                        break;
                    }
                    Err(e) => {
                        let _ = event_tx
                            .send(ClientEvent::Disconnected(format!("Connection lost: {}", e)));
                        break;
                    }
                }
            }
        });
    }

    /// Decode a server frame into a client event
    fn frame_to_event(frame: Frame) -> Result<ClientEvent> {
        let event = match frame.frame_type {
            FrameType::Me => ClientEvent::Me(Me::decode_frame(&frame)?),
            FrameType::AuthFailed => ClientEvent::AuthFailed(AuthFailed::decode_frame(&frame)?),
            FrameType::RoomHistory => ClientEvent::RoomHistory(RoomHistory::decode_frame(&frame)?),
            FrameType::MessageNew => ClientEvent::MessageNew(MessageNew::decode_frame(&frame)?),
            FrameType::MessageError => {
                ClientEvent::MessageError(MessageError::decode_frame(&frame)?)
            }
            FrameType::PresenceUpdate => {
                ClientEvent::PresenceUpdate(PresenceUpdate::decode_frame(&frame)?)
            }
            FrameType::DmInvited => ClientEvent::DmInvited(DmInvited::decode_frame(&frame)?),
            FrameType::Error => ClientEvent::ServerError(Error::decode_frame(&frame)?),
            other => {
                return Err(RelayError::protocol(format!(
                    "Unexpected server frame {:?}",
                    other
                )))
            }
        };
        Ok(event)
    }

    /// Join a room and request its history
    pub async fn join_room(&self, room_id: RoomId) -> Result<()> {
        self.send_request(&JoinRoom { room_id }).await
    }

    /// Open the canonical DM room with another identity
    pub async fn dm_initiate(&self, to_identity_id: impl Into<String>) -> Result<()> {
        self.send_request(&DmInitiate {
            to_identity_id: to_identity_id.into(),
        })
        .await
    }

    /// Send a text message to a room
    pub async fn send_message(&self, room_id: RoomId, content: impl Into<String>) -> Result<()> {
        self.send_request(&SendMessage {
            room_id,
            content: content.into(),
            kind: MessageKind::Text,
            metadata: serde_json::json!({}),
        })
        .await
    }

    /// Send a message with an explicit kind and metadata
    pub async fn send_message_with(
        &self,
        room_id: RoomId,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.send_request(&SendMessage {
            room_id,
            content: content.into(),
            kind,
            metadata,
        })
        .await
    }

    /// Encode and write a request frame on the control stream
    async fn send_request<T: Encodable>(&self, msg: &T) -> Result<()> {
        let control = self
            .control_send
            .as_ref()
            .ok_or_else(|| RelayError::connection("Not connected to relay"))?;

        let frame = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode request: {}", e)))?;

        let mut send = control.lock().await;
        send.write_all(&frame.encode_to_bytes()).await?;
        Ok(())
    }

    /// Disconnect from the relay
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(control) = self.control_send.take() {
            let goodbye = Goodbye {
                reason: "client disconnect".to_string(),
            };
            if let Ok(frame) = goodbye.encode_frame() {
                let mut send = control.lock().await;
                let _ = send.write_all(&frame.encode_to_bytes()).await;
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.close(0u32.into(), b"Client disconnect");
            info!("Disconnected from relay");
        }

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"Client shutdown");
        }

        Ok(())
    }

    /// Check if connected to the relay
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Custom certificate verifier that accepts any certificate (INSECURE - for development only)
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ECDSA_SHA1_Legacy,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}
