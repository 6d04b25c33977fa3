//! Error types for the data publisher

use gateway_codec::CodecError;
use gateway_network::TransportError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cryptographic error: {message}")]
    Crypto { message: String },

    #[error("Security catalog error: {message}")]
    Catalog { message: String },

    #[error("Metadata error: {message}")]
    Metadata { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("No connected client {client_id}")]
    ClientNotFound { client_id: Uuid },

    #[error("No connected client with enumerated index {index}")]
    ClientIndexOutOfRange { index: usize },

    #[error("Subscription error: {message}")]
    Subscription { message: String },
}

pub type Result<T> = std::result::Result<T, PublisherError>;

impl PublisherError {
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::Subscription {
            message: message.into(),
        }
    }
}
