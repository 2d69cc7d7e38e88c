//! Configuration consumed from the host application
//!
//! Stored as JSON. A missing or empty file yields the defaults, so a host can
//! start with no configuration and add mappings later through the API.

use crate::connectivity::{MappingSpec, Protocol};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

/// One port the host application wants forwarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredMapping {
    /// Transport protocol
    pub protocol: Protocol,
    /// Port the application listens on
    pub internal_port: u16,
    /// Preferred external port (0 = same as internal)
    #[serde(default)]
    pub external_port_hint: u16,
    /// Description shown on the router
    #[serde(default)]
    pub description: String,
    /// Requested lease in seconds (0 asks for no expiry)
    pub lease_secs: u32,
}

impl DesiredMapping {
    /// Turn into a spec for `internal_host`
    pub fn to_spec(&self, internal_host: Ipv4Addr) -> MappingSpec {
        MappingSpec::new(
            self.protocol,
            internal_host,
            self.internal_port,
            Duration::from_secs(u64::from(self.lease_secs)),
        )
        .with_external_port(self.external_port_hint)
        .with_description(self.description.clone())
    }
}

/// NAT traversal configuration
///
/// # Example
/// ```rust,no_run
/// use portlease::config::NatConfig;
///
/// // Load configuration (returns defaults if the file doesn't exist)
/// let config = NatConfig::load("portlease.json").expect("Failed to load");
/// config.validate().expect("Invalid configuration");
///
/// println!("{} mappings, tick every {:?}", config.mappings.len(), config.tick_interval());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Ports to forward
    pub mappings: Vec<DesiredMapping>,
    /// LAN address to forward to; detected when absent
    pub internal_host: Option<Ipv4Addr>,
    /// Bound for one discovery cycle in milliseconds
    pub discovery_timeout_ms: u64,
    /// Bound for one gateway control call in milliseconds
    pub call_timeout_ms: u64,
    /// Renewal scheduler tick in milliseconds
    pub tick_interval_ms: u64,
    /// Renew once the remaining lease drops below this fraction of the granted lease
    pub renewal_threshold: f64,
    /// External ports tried per mapping before giving up
    pub max_port_attempts: u32,
    /// Consecutive unreachable ticks before re-discovery
    pub unreachable_threshold: u32,
    /// Discovery retry cadence while no gateway is known, in milliseconds
    pub rediscovery_interval_ms: u64,
    /// Refresh cadence for permanent grants in milliseconds
    pub permanent_refresh_ms: u64,
    /// Hard deadline for the shutdown release pass in milliseconds
    pub shutdown_deadline_ms: u64,
    /// Prefix stamped on every mapping description
    pub description_tag: String,
    /// Delete leftovers of earlier runs after discovery
    pub purge_stale_mappings: bool,
}

impl NatConfig {
    /// Load configuration from a JSON file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// The loaded configuration, or the defaults if the file doesn't exist
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Check values the subsystem cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.renewal_threshold > 0.0 && self.renewal_threshold < 1.0) {
            return Err(Error::Config(format!(
                "renewal_threshold must be between 0 and 1, got {}",
                self.renewal_threshold
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be non-zero".to_string()));
        }
        if self.discovery_timeout_ms == 0 || self.call_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if self.max_port_attempts == 0 {
            return Err(Error::Config("max_port_attempts must be at least 1".to_string()));
        }

        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            if mapping.internal_port == 0 {
                return Err(Error::Config(format!(
                    "mapping '{}' has internal port 0",
                    mapping.description
                )));
            }
            if !seen.insert((mapping.protocol, mapping.internal_port)) {
                return Err(Error::Config(format!(
                    "duplicate mapping for {} port {}",
                    mapping.protocol, mapping.internal_port
                )));
            }
        }

        Ok(())
    }

    /// Discovery timeout
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Per-call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Scheduler tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Discovery retry cadence without a gateway
    pub fn rediscovery_interval(&self) -> Duration {
        Duration::from_millis(self.rediscovery_interval_ms)
    }

    /// Refresh cadence for permanent grants
    pub fn permanent_refresh(&self) -> Duration {
        Duration::from_millis(self.permanent_refresh_ms)
    }

    /// Shutdown deadline
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            mappings: Vec::new(),
            internal_host: None,
            discovery_timeout_ms: 5_000,
            call_timeout_ms: 3_000,
            tick_interval_ms: 60_000,
            renewal_threshold: 0.5,
            max_port_attempts: 8,
            unreachable_threshold: 3,
            rediscovery_interval_ms: 300_000,
            permanent_refresh_ms: 3_600_000,
            shutdown_deadline_ms: 5_000,
            description_tag: "portlease".to_string(),
            purge_stale_mappings: true,
        }
    }
}
