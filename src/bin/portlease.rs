//! Portlease daemon
//!
//! Keeps the ports listed in a JSON configuration forwarded on the LAN's UPnP
//! gateway until interrupted, then removes them.
//!
//! Usage: `portlease [config.json]`

use anyhow::Context;
use portlease::config::NatConfig;
use portlease::connectivity::{IgdLocator, LogFallback, NatTraversal, Reachability};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "portlease.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    portlease::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = NatConfig::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path))?;

    if config.mappings.is_empty() {
        warn!("No mappings configured in {}; nothing to forward", path);
    }

    let nat = NatTraversal::start(config, Arc::new(IgdLocator::new()), Arc::new(LogFallback))
        .await
        .context("Failed to start NAT traversal")?;

    for status in nat.manager().status().await {
        info!(
            "{} -> {} [{:?}] {}",
            status.key(),
            status.internal,
            status.state,
            status.description
        );
    }

    match nat.reachability().await {
        Reachability::Direct { external_ip, ports } => {
            for key in ports {
                info!("Reachable at {}:{} ({})", external_ip, key.external_port, key.protocol);
            }
        }
        Reachability::Fallback { reason } => {
            warn!("Not directly reachable: {}", reason);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let report = nat.shutdown().await;
    if report.timed_out {
        warn!("Shutdown deadline reached; {} mappings left to expire", report.failed);
    }
    Ok(())
}
