//! Publisher Configuration Module
//!
//! Loads [`PublisherConfig`] from an optional TOML file with `GATEWAY_`
//! environment overrides layered on top. Nested keys use `__`, so
//! `GATEWAY_TLS__CERTIFICATE` sets `tls.certificate`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Default metadata expressions sent on MetaDataRefresh
pub const DEFAULT_METADATA_TABLES: &str =
    "SELECT * FROM DeviceDetail;SELECT * FROM MeasurementDetail;SELECT * FROM PhasorDetail";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "GATEWAY";

/// How subscribers prove their identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Plain TCP; authentication optional
    #[default]
    None,
    /// TLS with certificate-derived identity
    Tls,
    /// Plain TCP with shared-secret token authentication
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// TLS identity of the command channel
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub require_client_certificate: bool,
}

/// Complete data publisher configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub name: String,
    pub node_id: Uuid,
    pub listen_address: SocketAddr,
    pub security_mode: SecurityMode,
    pub require_authentication: bool,
    pub encrypt_payload: bool,
    pub shared_database: bool,
    pub allow_payload_compression: bool,
    pub compression_strength: u32,
    pub allow_synchronized_subscription: bool,
    pub use_base_time_offsets: bool,
    pub cipher_key_rotation_period_ms: u64,

    // Command channel
    pub payload_aware: bool,
    pub payload_marker: Vec<u8>,
    pub max_payload_size: usize,
    pub max_send_queue_size: Option<usize>,
    pub command_channel_restart_ms: u64,

    pub buffer_block_retransmission_timeout_ms: u64,
    /// Semicolon-separated select expressions
    pub metadata_tables: String,
    pub notifications_path: PathBuf,
    pub catalog_path: Option<PathBuf>,
    pub log_format: LogFormat,
    pub tls: TlsConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            name: "DataPublisher".to_string(),
            node_id: Uuid::nil(),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 6165)),
            security_mode: SecurityMode::None,
            require_authentication: false,
            encrypt_payload: false,
            shared_database: false,
            allow_payload_compression: true,
            compression_strength: 31,
            allow_synchronized_subscription: true,
            use_base_time_offsets: false,
            cipher_key_rotation_period_ms: 60_000,
            payload_aware: true,
            payload_marker: vec![0xAA, 0xBB, 0xCC, 0xDD],
            max_payload_size: 1024 * 1024,
            max_send_queue_size: None,
            command_channel_restart_ms: 2000,
            buffer_block_retransmission_timeout_ms: 5000,
            metadata_tables: DEFAULT_METADATA_TABLES.to_string(),
            notifications_path: PathBuf::from("."),
            catalog_path: None,
            log_format: LogFormat::Pretty,
            tls: TlsConfig::default(),
        }
    }
}

impl PublisherConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Same as [`load`](Self::load) with a caller-chosen environment prefix.
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading publisher config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        let mut config = config.normalized();
        config.expand_paths()?;
        config.validate()?;
        debug!(?config, "Publisher configuration loaded");
        Ok(config)
    }

    /// Parses a TOML document directly, without environment overrides.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse TOML configuration")?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// TLS and gateway modes always authenticate.
    pub fn normalized(mut self) -> Self {
        if self.security_mode != SecurityMode::None {
            self.require_authentication = true;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.payload_marker.is_empty() {
            bail!("payload_marker must not be empty");
        }
        if self.max_send_queue_size == Some(0) {
            bail!("max_send_queue_size must be greater than zero when set");
        }
        if self.encrypt_payload && self.cipher_key_rotation_period_ms == 0 {
            bail!("cipher_key_rotation_period_ms must be non-zero when encrypt_payload is enabled");
        }
        if self.security_mode == SecurityMode::Tls
            && (self.tls.certificate.is_none() || self.tls.private_key.is_none())
        {
            bail!("security_mode = \"tls\" requires tls.certificate and tls.private_key");
        }
        if self.max_payload_size == 0 {
            bail!("max_payload_size must be greater than zero");
        }
        Ok(())
    }

    /// Expands `$VAR` and `~` in configured paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.notifications_path = expand(&self.notifications_path)
            .context("Failed to expand notifications_path")?;
        if let Some(path) = &self.catalog_path {
            self.catalog_path = Some(expand(path).context("Failed to expand catalog_path")?);
        }
        if let Some(path) = &self.tls.certificate {
            self.tls.certificate = Some(expand(path).context("Failed to expand tls.certificate")?);
        }
        if let Some(path) = &self.tls.private_key {
            self.tls.private_key = Some(expand(path).context("Failed to expand tls.private_key")?);
        }
        Ok(())
    }

    pub fn cipher_key_rotation_period(&self) -> Duration {
        Duration::from_millis(self.cipher_key_rotation_period_ms)
    }

    pub fn command_channel_restart_delay(&self) -> Duration {
        Duration::from_millis(self.command_channel_restart_ms)
    }

    pub fn buffer_block_retransmission_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_block_retransmission_timeout_ms)
    }

    /// Metadata select expressions, blank entries removed
    pub fn metadata_expressions(&self) -> Vec<String> {
        self.metadata_tables
            .split(';')
            .map(str::trim)
            .filter(|expression| !expression.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Gzip level derived from the configured strength
    pub fn gzip_level(&self) -> u32 {
        self.compression_strength.min(9)
    }

    /// Notification backlog file for this publisher
    pub fn notifications_file(&self) -> PathBuf {
        self.notifications_path
            .join(format!("{}Notifications.txt", self.name))
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    let text = path.to_string_lossy();
    let expanded = shellexpand::full(&text)?;
    Ok(PathBuf::from(expanded.as_ref()))
}
