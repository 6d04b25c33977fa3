//! # Gateway Protocol Codec
//!
//! ## Purpose
//!
//! This crate is the "Rules" layer of the gateway publisher: every byte layout
//! that crosses the wire is encoded and decoded here, with no I/O of its own.
//!
//! - Payload-aware framing (`marker || u32 LE length`) shared by transport and protocol
//! - Command and response codes with an explicit `Unknown` arm
//! - Response envelope `[response][in_response_to][len u32 BE][payload]`
//! - Operational mode negotiation flags and client text encodings
//! - Connection-string settings parsing
//! - Signal index cache and metadata serialization (native and common formats)
//! - Compact and full measurement serialization inside data packets
//!
//! ## Architecture Role
//!
//! ```text
//! [codec] → network/             → publisher/
//!    ↓          ↓                      ↓
//! Framing   Sockets, TLS,        Session protocol,
//! Envelopes send mailboxes       subscriptions, rights
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling (belongs in network/)
//! - Subscriber sessions, rights or cipher keys (belongs in the publisher service)

pub mod compression;
pub mod connection_string;
pub mod error;
pub mod measurement;
pub mod metadata;
pub mod payload;
pub mod protocol;
pub mod signal_index;
pub mod text;
mod wire;

pub use connection_string::ConnectionSettings;
pub use error::{CodecError, Result};
pub use measurement::{
    BaseTimeOffsets, CompactMeasurement, DataPacket, DataPacketWriter, Measurement,
};
pub use metadata::{MetadataColumn, MetadataSet, MetadataTable, MetadataValue, ValueKind};
pub use payload::{PayloadFramer, DEFAULT_MARKER, LENGTH_SEGMENT};
pub use protocol::{
    encode_command, encode_response, CompressionMode, DataPacketFlags, OperationalModes,
    ResponseFrame, ServerCommand, ServerResponse, RESPONSE_HEADER_SIZE,
};
pub use signal_index::{SignalIndexCache, SignalReference};
pub use text::TextEncoding;
