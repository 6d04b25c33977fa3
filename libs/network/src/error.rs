//! Transport Error Types
//!
//! Error handling for the command channel transport: socket faults, TLS
//! failures, framing violations and send-queue load shedding.

use std::net::SocketAddr;

use thiserror::Error;
use uuid::Uuid;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
    },

    /// No live connection is registered under the identifier
    #[error("No client found for ID {client_id}")]
    ClientNotFound { client_id: Uuid },

    /// Payload framing violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// TLS handshake and certificate errors
    #[error("Security error: {message}")]
    Security { message: String },

    /// Send queue exceeded its capacity and was shed
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// A queued send was discarded before reaching the socket
    #[error("Send to client {client_id} was discarded: {reason}")]
    QueueCleared { client_id: Uuid, reason: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn queue_cleared(client_id: Uuid, reason: impl Into<String>) -> Self {
        Self::QueueCleared {
            client_id,
            reason: reason.into(),
        }
    }

    /// Errors that mean the peer is gone rather than a transient hiccup
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::NotConnected
            ),
            Self::ClientNotFound { .. } => true,
            _ => false,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Connection { .. } => "connection",
            Self::ClientNotFound { .. } => "client_not_found",
            Self::Protocol { .. } => "protocol",
            Self::Configuration { .. } => "configuration",
            Self::Security { .. } => "security",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::QueueCleared { .. } => "queue_cleared",
            Self::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<gateway_codec::CodecError> for TransportError {
    fn from(err: gateway_codec::CodecError) -> Self {
        Self::protocol(err.to_string())
    }
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        Self::security(err.to_string())
    }
}
