//! Error handling for the relay server

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay server error types
#[derive(Debug, Clone)]
pub enum RelayError {
    /// Missing, invalid or expired credential; the handshake is rejected
    Unauthenticated(String),
    /// Credential verified but no matching identity exists
    IdentityMissing(String),
    /// Message store append/query failure
    StoreUnavailable(String),
    /// Client sent an event missing required fields
    MalformedRequest(String),
    /// Network-related errors
    Network(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Protocol errors (unexpected frames, bad state transitions)
    Protocol(String),
    /// Connection errors
    Connection(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
    /// Server internal error
    Internal(String),
}

impl RelayError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            RelayError::Unauthenticated(_) => 1000,
            RelayError::IdentityMissing(_) => 1001,
            RelayError::StoreUnavailable(_) => 1002,
            RelayError::MalformedRequest(_) => 1003,
            RelayError::Network(_) => 1004,
            RelayError::Serialization(_) => 1005,
            RelayError::Protocol(_) => 1006,
            RelayError::Connection(_) => 1007,
            RelayError::Config(_) => 1008,
            RelayError::Timeout(_) => 1009,
            RelayError::Internal(_) => 1010,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            RelayError::Unauthenticated(msg) => msg,
            RelayError::IdentityMissing(msg) => msg,
            RelayError::StoreUnavailable(msg) => msg,
            RelayError::MalformedRequest(msg) => msg,
            RelayError::Network(msg) => msg,
            RelayError::Serialization(msg) => msg,
            RelayError::Protocol(msg) => msg,
            RelayError::Connection(msg) => msg,
            RelayError::Config(msg) => msg,
            RelayError::Timeout(msg) => msg,
            RelayError::Internal(msg) => msg,
        }
    }

    /// True for the two handshake-rejection variants
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Unauthenticated(_) | RelayError::IdentityMissing(_)
        )
    }

    /// Create an unauthenticated error
    pub fn unauthenticated<T: Into<String>>(msg: T) -> Self {
        RelayError::Unauthenticated(msg.into())
    }

    /// Create an identity-missing error
    pub fn identity_missing<T: Into<String>>(msg: T) -> Self {
        RelayError::IdentityMissing(msg.into())
    }

    /// Create a store-unavailable error
    pub fn store_unavailable<T: Into<String>>(msg: T) -> Self {
        RelayError::StoreUnavailable(msg.into())
    }

    /// Create a malformed-request error
    pub fn malformed<T: Into<String>>(msg: T) -> Self {
        RelayError::MalformedRequest(msg.into())
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        RelayError::Network(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        RelayError::Serialization(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        RelayError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        RelayError::Connection(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        RelayError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        RelayError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        RelayError::Internal(msg.into())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Unauthenticated(msg) => write!(f, "Unauthenticated: {}", msg),
            RelayError::IdentityMissing(msg) => write!(f, "Identity missing: {}", msg),
            RelayError::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            RelayError::MalformedRequest(msg) => write!(f, "Malformed request: {}", msg),
            RelayError::Network(msg) => write!(f, "Network error: {}", msg),
            RelayError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            RelayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            RelayError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Network(format!("IO error: {}", err))
    }
}

impl From<quinn::ConnectError> for RelayError {
    fn from(err: quinn::ConnectError) -> Self {
        RelayError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ConnectionError> for RelayError {
    fn from(err: quinn::ConnectionError) -> Self {
        RelayError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ReadError> for RelayError {
    fn from(err: quinn::ReadError) -> Self {
        RelayError::Network(format!("QUIC read error: {}", err))
    }
}

impl From<quinn::WriteError> for RelayError {
    fn from(err: quinn::WriteError) -> Self {
        RelayError::Network(format!("QUIC write error: {}", err))
    }
}

impl From<quinn::ReadToEndError> for RelayError {
    fn from(err: quinn::ReadToEndError) -> Self {
        RelayError::Network(format!("QUIC read to end error: {}", err))
    }
}

impl From<quinn::ClosedStream> for RelayError {
    fn from(err: quinn::ClosedStream) -> Self {
        RelayError::Connection(format!("Stream closed: {}", err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(format!("{:#}", err))
    }
}
