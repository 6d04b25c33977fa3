//! Catalog, configuration and publisher fixtures

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Result;
use data_publisher::{DataPublisher, SecurityCatalog};
use gateway_config::{PublisherConfig, SecurityMode};
use uuid::Uuid;

pub const SUBSCRIBER_ID: Uuid = Uuid::from_u128(0x5a);
pub const SHARED_SECRET: &str = "e2e-shared-secret";
pub const AUTH_KEY: &str = "e2e-auth-key";

/// `PPA:1`, granted to the subscriber
pub const SIGNAL_A: Uuid = Uuid::from_u128(0xa1);
/// `PPA:2`, granted to the subscriber
pub const SIGNAL_B: Uuid = Uuid::from_u128(0xb2);
/// `PPA:3`, no rule grants it
pub const SIGNAL_C: Uuid = Uuid::from_u128(0xc3);

pub const NODE_ID: Uuid = Uuid::from_u128(0x0de);

/// One loopback subscriber with explicit rights to signals A and B.
pub fn catalog() -> SecurityCatalog {
    let text = format!(
        r#"
[[subscribers]]
id = "{SUBSCRIBER_ID}"
acronym = "E2E"
name = "End To End"
shared_secret = "{SHARED_SECRET}"
auth_key = "{AUTH_KEY}"
valid_ip_addresses = "127.0.0.1"

[[measurements]]
signal_id = "{SIGNAL_A}"
source = "PPA"
id = 1
point_tag = "E2E:FREQ"
node_id = "{NODE_ID}"
device = "E2E-PMU"
signal_type = "FREQ"

[[measurements]]
signal_id = "{SIGNAL_B}"
source = "PPA"
id = 2
point_tag = "E2E:VPHM"
node_id = "{NODE_ID}"
device = "E2E-PMU"
signal_type = "VPHM"

[[measurements]]
signal_id = "{SIGNAL_C}"
source = "PPA"
id = 3
point_tag = "E2E:IPHM"
node_id = "{NODE_ID}"
device = "E2E-PMU"
signal_type = "IPHM"

[[devices]]
unique_id = "{DEVICE_ID}"
acronym = "E2E-PMU"
name = "End To End PMU"
node_id = "{NODE_ID}"
protocol = "IEEE C37.118"
frames_per_second = 30

[[rules]]
subscriber_id = "{SUBSCRIBER_ID}"
signal_id = "{SIGNAL_A}"
allowed = true

[[rules]]
subscriber_id = "{SUBSCRIBER_ID}"
signal_id = "{SIGNAL_B}"
allowed = true
"#,
        DEVICE_ID = Uuid::from_u128(0xde1),
    );
    // The document is a fixed literal.
    SecurityCatalog::from_toml(&text).expect("fixture catalog parses")
}

/// Open publisher on an ephemeral loopback port.
pub fn open_config(notifications_dir: &Path) -> PublisherConfig {
    PublisherConfig {
        name: "E2E".to_string(),
        node_id: NODE_ID,
        listen_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        notifications_path: notifications_dir.to_path_buf(),
        ..PublisherConfig::default()
    }
}

/// Shared-secret authentication with payload encryption.
pub fn gateway_config(notifications_dir: &Path) -> PublisherConfig {
    PublisherConfig {
        security_mode: SecurityMode::Gateway,
        require_authentication: true,
        encrypt_payload: true,
        ..open_config(notifications_dir)
    }
}

pub async fn start_publisher(config: PublisherConfig, catalog: SecurityCatalog) -> Result<(DataPublisher, SocketAddr)> {
    init_tracing();
    let publisher = DataPublisher::new(config, catalog)?;
    let addr = publisher.start().await?;
    Ok((publisher, addr))
}

/// Routes publisher logs to the test output; repeated calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
