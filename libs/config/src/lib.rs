//! # Gateway Configuration
//!
//! Configuration loading and defaults for the gateway data publisher.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gateway_config::PublisherConfig;
//!
//! let config = PublisherConfig::load(Some(std::path::Path::new("publisher.toml")))?;
//! println!("listening on {}", config.listen_address);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod publisher;

pub use publisher::{
    LogFormat, PublisherConfig, SecurityMode, TlsConfig, DEFAULT_METADATA_TABLES, ENV_PREFIX,
};
