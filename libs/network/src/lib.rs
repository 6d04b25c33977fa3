//! Gateway Network Infrastructure
//!
//! Transport plumbing for the data publisher: a payload-aware TCP/TLS command
//! channel server, per-client ordered send mailboxes, and the UDP data channel.
//!
//! The server knows nothing about commands or subscriptions. It delivers whole
//! payloads and lifecycle notifications as [`ServerEvent`]s and accepts opaque
//! byte payloads to send; protocol semantics live in the publisher service.

pub mod error;
pub mod transports;

pub use error::{Result, TransportError};
pub use transports::{
    CertificateFingerprint, MetricsSnapshot, SendCompletion, ServerEvent, TlsSettings, TransportConfig,
    TransportMetrics, TransportServer, TrustStore, UdpDataChannel,
};
