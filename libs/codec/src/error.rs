//! Codec-level errors
//!
//! Every decode path reports what it needed and what it found so protocol
//! handlers can turn the error straight into a human-readable Failed response.

use thiserror::Error;

/// Errors raised while encoding or decoding gateway wire structures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Buffer is too small to contain the expected structure
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Payload header marker did not match
    #[error("Invalid payload header: {reason}")]
    InvalidHeader { reason: String },

    /// Declared payload length exceeds the configured limit
    #[error("Payload length {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Text could not be decoded with the negotiated encoding
    #[error("Invalid {encoding} text: {message}")]
    InvalidText {
        encoding: &'static str,
        message: String,
    },

    /// Connection string is not well formed
    #[error("Malformed connection string: {0}")]
    ConnectionString(String),

    /// Structured value could not be (de)serialized
    #[error("Serialization failed ({format}): {message}")]
    Serialization {
        format: &'static str,
        message: String,
    },

    /// Compression or decompression failed
    #[error("Compression failed ({codec}): {message}")]
    Compression {
        codec: &'static str,
        message: String,
    },
}

impl CodecError {
    pub fn too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    pub fn serialization(format: &'static str, message: impl Into<String>) -> Self {
        Self::Serialization {
            format,
            message: message.into(),
        }
    }

    pub fn compression(codec: &'static str, message: impl Into<String>) -> Self {
        Self::Compression {
            codec,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Fails with [`CodecError::MessageTooSmall`] unless `buf` holds at least `need` bytes.
pub(crate) fn ensure_remaining(buf: &[u8], need: usize, context: &str) -> Result<()> {
    if buf.len() < need {
        return Err(CodecError::too_small(need, buf.len(), context));
    }
    Ok(())
}
