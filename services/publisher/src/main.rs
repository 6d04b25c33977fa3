//! Data publisher service binary

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use data_publisher::{DataPublisher, PublisherEvent, SecurityCatalog};
use gateway_config::{LogFormat, PublisherConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "data_publisher", about = "Gateway data publisher")]
struct Args {
    /// Configuration file (TOML); GATEWAY_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Security catalog file, overriding `catalog_path`
    #[arg(long)]
    catalog: Option<PathBuf>,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Status messages and exceptions are already logged where they are raised.
fn log_event(event: &PublisherEvent, as_json: bool) {
    if as_json {
        match serde_json::to_string(event) {
            Ok(json) => info!(event = %json, "Publisher event"),
            Err(e) => warn!(error = %e, "Failed to serialize publisher event"),
        }
        return;
    }
    if let PublisherEvent::ClientConnected {
        subscriber_id,
        connection_id,
        subscriber_info,
    } = event
    {
        info!(
            subscriber = %subscriber_id,
            connection = %connection_id,
            info = subscriber_info.as_deref().unwrap_or(""),
            "Subscriber connected"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = PublisherConfig::load(args.config.as_deref())?;
    init_logging(config.log_format);
    let json_events = config.log_format == LogFormat::Json;

    let catalog = match args.catalog.as_deref().or(config.catalog_path.as_deref()) {
        Some(path) => SecurityCatalog::load(path)
            .with_context(|| format!("Failed to load security catalog {}", path.display()))?,
        None => {
            warn!("No security catalog configured, no subscribers or signals are known");
            SecurityCatalog::default()
        }
    };

    let publisher = DataPublisher::new(config, catalog)?;
    let mut events = publisher.subscribe_events();
    let local_addr = publisher.start().await?;
    info!(%local_addr, "Waiting for subscribers, press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event, json_events),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    publisher.stop();
    info!(counters = ?publisher.lifetime_counters(), "Shutdown complete");
    Ok(())
}
