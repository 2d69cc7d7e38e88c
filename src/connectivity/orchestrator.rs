//! NAT traversal orchestrator - wires discovery, leases and renewal together
//!
//! This is the entry point a host application uses: hand it a configuration,
//! keep the returned [`NatTraversal`] alive while the ports should stay open,
//! and call [`NatTraversal::shutdown`] on the way out.

use super::fallback::{FallbackChannel, FallbackReason, Reachability};
use super::gateway::{local_ipv4_for_gateway, GatewayLocator};
use super::manager::{LeaseManager, LeaseSettings, ShutdownReport};
use super::scheduler::{RenewalScheduler, SchedulerConfig};
use super::types::MappingError;
use crate::config::{DesiredMapping, NatConfig};
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Finds the LAN address mappings should forward to
pub(crate) type HostDetector =
    Arc<dyn Fn() -> std::result::Result<Ipv4Addr, MappingError> + Send + Sync>;

/// A running NAT traversal subsystem
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use portlease::config::NatConfig;
/// use portlease::connectivity::{IgdLocator, LogFallback, NatTraversal};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = NatConfig::load("portlease.json")?;
/// let nat = NatTraversal::start(config, Arc::new(IgdLocator::new()), Arc::new(LogFallback)).await?;
///
/// if nat.reachability().await.is_direct() {
///     println!("Directly reachable");
/// }
///
/// nat.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct NatTraversal {
    manager: LeaseManager,
    scheduler: Option<RenewalScheduler>,
    host_retry: Option<JoinHandle<()>>,
    internal_host: Arc<OnceLock<Ipv4Addr>>,
    shutdown_deadline: Duration,
}

impl NatTraversal {
    /// Discover a gateway, declare every configured mapping and start renewing
    ///
    /// A missing gateway is not an error: mappings stay `Requested` and the
    /// scheduler keeps retrying discovery. Neither is an unknown LAN address:
    /// the configured mappings are declared once it can be determined.
    /// Per-mapping failures are logged and reported to `fallback`.
    pub async fn start(
        config: NatConfig,
        locator: Arc<dyn GatewayLocator>,
        fallback: Arc<dyn FallbackChannel>,
    ) -> Result<Self> {
        let detect_host: HostDetector = Arc::new(local_ipv4_for_gateway);
        Self::start_with_host_detector(config, locator, fallback, detect_host).await
    }

    pub(crate) async fn start_with_host_detector(
        config: NatConfig,
        locator: Arc<dyn GatewayLocator>,
        fallback: Arc<dyn FallbackChannel>,
        detect_host: HostDetector,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Starting NAT traversal for {} configured mappings",
            config.mappings.len()
        );

        let internal_host = Arc::new(OnceLock::new());
        let host = match config.internal_host {
            Some(host) => Some(host),
            None => match detect_host() {
                Ok(host) => Some(host),
                Err(e) => {
                    warn!(
                        "Cannot determine the LAN address to forward to ({}); retrying later",
                        e
                    );
                    fallback.engage(&FallbackReason::NoGateway);
                    None
                }
            },
        };

        let mut settings = LeaseSettings::from(&config);
        settings.internal_host = host;
        let manager = LeaseManager::new(locator, settings).with_fallback(fallback);

        if let Err(e) = manager.discover().await {
            warn!("No gateway at startup ({}); mappings stay pending", e);
        }

        let host_retry = match host {
            Some(host) => {
                debug!("Forwarding to internal host {}", host);
                let _ = internal_host.set(host);
                declare_mappings(&manager, &config.mappings, host).await?;
                None
            }
            None => Some(tokio::spawn(declare_when_host_known(
                manager.clone(),
                config.mappings.clone(),
                detect_host,
                internal_host.clone(),
                config.rediscovery_interval(),
            ))),
        };

        let scheduler = RenewalScheduler::spawn(manager.clone(), SchedulerConfig::from(&config));

        Ok(Self {
            manager,
            scheduler: Some(scheduler),
            host_retry,
            internal_host,
            shutdown_deadline: config.shutdown_deadline(),
        })
    }

    /// The lease manager, for declaring or releasing mappings at runtime
    pub fn manager(&self) -> &LeaseManager {
        &self.manager
    }

    /// LAN address mappings forward to, once known
    pub fn internal_host(&self) -> Option<Ipv4Addr> {
        self.internal_host.get().copied()
    }

    /// Whether peers can reach this host directly
    pub async fn reachability(&self) -> Reachability {
        self.manager.reachability().await
    }

    /// Stop renewing and release every mapping, returning within the
    /// configured deadline
    ///
    /// A renewal tick in progress gets half of the deadline to finish before
    /// it is aborted; releasing gets whatever is left.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("Shutting down NAT traversal");
        let started = Instant::now();

        if let Some(retry) = self.host_retry.take() {
            retry.abort();
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop(self.shutdown_deadline / 2).await;
        }

        let remaining = self.shutdown_deadline.saturating_sub(started.elapsed());
        self.manager.shutdown(remaining).await
    }
}

impl Drop for NatTraversal {
    fn drop(&mut self) {
        if let Some(retry) = self.host_retry.take() {
            retry.abort();
        }
    }
}

async fn declare_mappings(
    manager: &LeaseManager,
    mappings: &[DesiredMapping],
    host: Ipv4Addr,
) -> Result<()> {
    for desired in mappings {
        let spec = desired.to_spec(host);
        match manager.ensure(spec).await {
            Ok(status) => info!(
                "{} -> {}:{} is {:?}",
                status.key(),
                host,
                desired.internal_port,
                status.state
            ),
            Err(MappingError::InvalidSpec(reason)) => {
                return Err(Error::Config(reason));
            }
            Err(e) => warn!(
                "{} port {} not mapped: {}",
                desired.protocol, desired.internal_port, e
            ),
        }
    }
    Ok(())
}

/// Retry LAN address detection every `every` and declare `mappings` once it works
async fn declare_when_host_known(
    manager: LeaseManager,
    mappings: Vec<DesiredMapping>,
    detect_host: HostDetector,
    internal_host: Arc<OnceLock<Ipv4Addr>>,
    every: Duration,
) {
    let every = every.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match detect_host() {
            Ok(host) => {
                info!("LAN address is {}; declaring configured mappings", host);
                let _ = internal_host.set(host);
                if let Err(e) = declare_mappings(&manager, &mappings, host).await {
                    warn!("Configured mappings rejected: {}", e);
                }
                return;
            }
            Err(e) => debug!("LAN address still unknown: {}", e),
        }
    }
}
