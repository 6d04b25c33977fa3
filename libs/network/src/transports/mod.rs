//! Command Channel Transports
//!
//! The reliable command channel is a TCP (optionally TLS) server; the optional
//! secondary data channel is a connected UDP socket per subscriber.
//!
//! - [`server`]: listener supervision, per-client tasks and the event stream
//! - [`receive`]: payload reassembly and the per-client read cursor
//! - [`send_queue`]: ordered, optionally bounded, per-client send mailbox
//! - [`tls`]: rustls acceptor and fingerprint-based client certificate trust
//! - [`udp`]: best-effort datagram publication
//! - [`metrics`]: shared counters

pub mod metrics;
pub mod receive;
pub mod send_queue;
pub mod server;
pub mod tls;
pub mod udp;


pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use receive::{PayloadReceiver, ReceiveCursor};
pub use send_queue::{run_writer, SendCompletion, SendMailbox};
pub use server::{ServerEvent, TransportConfig, TransportServer};
pub use tls::{load_certificates, load_private_key, CertificateFingerprint, TlsSettings, TrustStore};
pub use udp::{UdpDataChannel, MAX_DATAGRAM_SIZE};
