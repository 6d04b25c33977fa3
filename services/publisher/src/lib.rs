//! # Gateway Data Publisher
//!
//! Server side of the gateway exchange protocol. Subscribers connect to the
//! command channel, negotiate operational modes, optionally authenticate,
//! request metadata and subscribe to signals. Measurements handed to
//! [`DataPublisher::publish`] are routed to every subscription that asked
//! for them and leave as compact or full data packets, optionally compressed
//! and encrypted with per-client rotating keys.
//!
//! ## Architecture
//!
//! ```text
//! TransportServer ──ServerEvent──> dispatch ──payload──> per-client command worker
//!                                                              │
//!                                                        session engine
//!                                                              │
//!   publish() ──> RoutingTable ──> Subscription task ──> ClientConnection ──> TCP / UDP
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use data_publisher::{DataPublisher, SecurityCatalog};
//! use gateway_config::PublisherConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let publisher = DataPublisher::new(PublisherConfig::default(), SecurityCatalog::default())?;
//! let addr = publisher.start().await?;
//! println!("publishing on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod cipher;
pub mod counters;
mod engine;
pub mod error;
pub mod events;
pub mod metadata;
pub mod notifications;
pub mod publisher;
pub mod registry;
pub mod subscription;

pub use catalog::{CatalogHandle, RightsSource, SecurityCatalog};
pub use cipher::{CipherKeyPair, CipherKeys};
pub use counters::LifetimeSnapshot;
pub use error::{PublisherError, Result};
pub use events::PublisherEvent;
pub use metadata::{InMemoryMetadata, MetadataSource};
pub use publisher::DataPublisher;
pub use registry::{ClientSummary, SubscriberIdentity};
pub use subscription::{SubscriptionMode, SubscriptionSettings};
