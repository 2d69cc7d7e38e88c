//! Common types for the port mapping subsystem

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP protocol
    TCP,
    /// UDP protocol
    UDP,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::TCP => write!(f, "TCP"),
            Protocol::UDP => write!(f, "UDP"),
        }
    }
}

/// Identity of a mapping on the gateway: one external port per protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MappingKey {
    /// Transport protocol
    pub protocol: Protocol,
    /// External (WAN side) port
    pub external_port: u16,
}

impl MappingKey {
    /// Create a new key
    pub fn new(protocol: Protocol, external_port: u16) -> Self {
        Self {
            protocol,
            external_port,
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.external_port)
    }
}

/// A port the host application wants reachable from outside
///
/// # Example
///
/// ```
/// use std::net::Ipv4Addr;
/// use std::time::Duration;
/// use portlease::connectivity::{MappingSpec, Protocol};
///
/// let spec = MappingSpec::new(
///     Protocol::TCP,
///     Ipv4Addr::new(192, 168, 1, 42),
///     51413,
///     Duration::from_secs(7200),
/// )
/// .with_description("game server");
///
/// assert_eq!(spec.preferred_external_port(), 51413);
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSpec {
    /// Transport protocol
    pub protocol: Protocol,
    /// LAN address of the host receiving forwarded traffic
    pub internal_host: Ipv4Addr,
    /// Port on the internal host
    pub internal_port: u16,
    /// Preferred external port (0 = same as the internal port)
    pub external_port_hint: u16,
    /// Human-readable description shown in the router UI
    pub description: String,
    /// Requested lease duration (zero asks for no automatic expiry)
    pub lease: Duration,
}

impl MappingSpec {
    /// Create a spec asking for the same external port as the internal one
    pub fn new(protocol: Protocol, internal_host: Ipv4Addr, internal_port: u16, lease: Duration) -> Self {
        Self {
            protocol,
            internal_host,
            internal_port,
            external_port_hint: internal_port,
            description: String::new(),
            lease,
        }
    }

    /// Prefer a specific external port
    pub fn with_external_port(mut self, external_port: u16) -> Self {
        self.external_port_hint = external_port;
        self
    }

    /// Set the description shown on the gateway
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Internal socket address traffic is forwarded to
    pub fn internal_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.internal_host, self.internal_port)
    }

    /// The first external port to try
    pub fn preferred_external_port(&self) -> u16 {
        if self.external_port_hint == 0 {
            self.internal_port
        } else {
            self.external_port_hint
        }
    }

    /// Reject specs no gateway could honour
    pub fn validate(&self) -> Result<(), MappingError> {
        if self.internal_port == 0 {
            return Err(MappingError::InvalidSpec(
                "internal port must be non-zero".to_string(),
            ));
        }
        if self.internal_host.is_unspecified() || self.internal_host.is_broadcast() {
            return Err(MappingError::InvalidSpec(format!(
                "{} is not a usable internal host",
                self.internal_host
            )));
        }
        if self.lease.as_secs() > u64::from(u32::MAX) {
            return Err(MappingError::InvalidSpec(
                "lease does not fit the gateway's 32-bit lease field".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a mapping
///
/// `Requested → Active → RenewalDue → Active | Expired | Removed`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MappingState {
    /// Declared but not acknowledged by a gateway yet
    Requested,
    /// Acknowledged, lease running
    Active,
    /// Lease fell below the renewal threshold
    RenewalDue,
    /// Lease ran out before it could be renewed
    Expired,
    /// Alternate-port budget exhausted
    Unavailable,
    /// Torn down
    Removed,
}

impl MappingState {
    /// Every state except `Removed`
    pub fn is_live(&self) -> bool {
        !matches!(self, MappingState::Removed)
    }

    /// The gateway currently holds a lease for this mapping
    pub fn is_granted(&self) -> bool {
        matches!(self, MappingState::Active | MappingState::RenewalDue)
    }
}

/// One discovered Internet Gateway Device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDescriptor {
    /// Address the device description was fetched from
    pub addr: SocketAddr,
    /// Absolute control URL of the WAN connection service
    pub control_url: String,
    /// UPnP device/service type that answered the search
    pub service_type: String,
    /// When discovery produced this descriptor
    pub discovered_at: DateTime<Utc>,
}

/// A single AddPortMapping call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    /// Transport protocol
    pub protocol: Protocol,
    /// External port to claim
    pub external_port: u16,
    /// Internal client address
    pub internal: SocketAddrV4,
    /// Requested lease
    pub lease: Duration,
    /// Description sent to the gateway
    pub description: String,
}

/// What the gateway acknowledged for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedMapping {
    /// Transport protocol
    pub protocol: Protocol,
    /// External port now forwarded
    pub external_port: u16,
    /// Internal client address
    pub internal: SocketAddrV4,
    /// Lease as reported by the gateway; zero means no automatic expiry
    pub lease: Duration,
}

/// One row of the gateway's mapping table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Transport protocol
    pub protocol: Protocol,
    /// External port
    pub external_port: u16,
    /// Internal client as reported (normally an IPv4 literal)
    pub internal_client: String,
    /// Internal port
    pub internal_port: u16,
    /// Description
    pub description: String,
    /// Remaining lease; zero means permanent
    pub lease: Duration,
}

impl MappingEntry {
    /// Internal client parsed as an IPv4 address
    pub fn internal_host(&self) -> Option<Ipv4Addr> {
        self.internal_client.trim().parse().ok()
    }

    /// Key of this entry
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.protocol, self.external_port)
    }
}

/// A desired mapping and its current state, owned by the lease manager
#[derive(Debug, Clone)]
pub struct PortMapping {
    /// Stable identifier across external port changes
    pub id: Uuid,
    /// What the application asked for
    pub spec: MappingSpec,
    /// External port currently claimed (or about to be)
    pub external_port: u16,
    /// Lifecycle state
    pub state: MappingState,
    /// Lease granted by the gateway, set only after an acknowledgment
    pub granted_lease: Option<Duration>,
    /// When the current lease was granted
    pub granted_at: Option<Instant>,
    /// Generation of the gateway handle that granted the lease
    pub gateway_generation: Option<u64>,
    /// Last failure observed for this mapping
    pub last_error: Option<String>,
}

impl PortMapping {
    /// Create a mapping in the `Requested` state
    pub fn new(spec: MappingSpec) -> Self {
        let external_port = spec.preferred_external_port();
        Self {
            id: Uuid::new_v4(),
            spec,
            external_port,
            state: MappingState::Requested,
            granted_lease: None,
            granted_at: None,
            gateway_generation: None,
            last_error: None,
        }
    }

    /// Registry key of this mapping
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.spec.protocol, self.external_port)
    }

    /// Record a gateway acknowledgment
    pub fn mark_granted(&mut self, granted: &GrantedMapping, generation: u64, now: Instant) {
        self.state = MappingState::Active;
        self.granted_lease = Some(granted.lease);
        self.granted_at = Some(now);
        self.gateway_generation = Some(generation);
        self.last_error = None;
    }

    /// Forget any lease and go back to `Requested`
    pub fn mark_requested(&mut self) {
        self.state = MappingState::Requested;
        self.granted_lease = None;
        self.granted_at = None;
        self.gateway_generation = None;
    }

    /// Granted with no automatic expiry
    pub fn is_permanent(&self) -> bool {
        self.granted_lease == Some(Duration::ZERO)
    }

    /// Lease time left at `now`; `None` when nothing is granted or the lease is permanent
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let lease = self.granted_lease?;
        let granted_at = self.granted_at?;
        if lease.is_zero() {
            return None;
        }
        Some(lease.saturating_sub(now.saturating_duration_since(granted_at)))
    }

    /// The granted lease has run out
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.remaining(now), Some(remaining) if remaining.is_zero())
    }

    /// Remaining lease is below `threshold` of the granted lease.
    ///
    /// Permanent grants are refreshed every `permanent_refresh` instead.
    pub fn needs_renewal(&self, now: Instant, threshold: f64, permanent_refresh: Duration) -> bool {
        let (Some(lease), Some(granted_at)) = (self.granted_lease, self.granted_at) else {
            return false;
        };
        let elapsed = now.saturating_duration_since(granted_at);
        if lease.is_zero() {
            return elapsed >= permanent_refresh;
        }
        lease.saturating_sub(elapsed) < lease.mul_f64(threshold)
    }

    /// Snapshot for the host application
    pub fn status(&self, now: Instant) -> MappingStatus {
        MappingStatus {
            id: self.id,
            protocol: self.spec.protocol,
            external_port: self.external_port,
            internal: self.spec.internal_addr(),
            description: self.spec.description.clone(),
            state: self.state,
            requested_lease: self.spec.lease,
            granted_lease: self.granted_lease,
            remaining: self.remaining(now),
            last_error: self.last_error.clone(),
        }
    }
}

/// Status of one mapping as reported to the host application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingStatus {
    /// Mapping identifier
    pub id: Uuid,
    /// Transport protocol
    pub protocol: Protocol,
    /// External port claimed or requested
    pub external_port: u16,
    /// Internal socket address
    pub internal: SocketAddrV4,
    /// Description
    pub description: String,
    /// Lifecycle state
    pub state: MappingState,
    /// Lease the application asked for
    pub requested_lease: Duration,
    /// Lease the gateway granted
    pub granted_lease: Option<Duration>,
    /// Lease left; `None` if not granted or permanent
    pub remaining: Option<Duration>,
    /// Last failure, if any
    pub last_error: Option<String>,
}

impl MappingStatus {
    /// Key of this mapping
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.protocol, self.external_port)
    }
}

/// Errors that can occur during discovery and port mapping
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    /// No gateway answered discovery
    #[error("No gateway found")]
    NotFound,

    /// The gateway violated the protocol
    #[error("Malformed gateway response: {0}")]
    MalformedResponse(String),

    /// Transport failure or timeout talking to the gateway
    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),

    /// Another internal host holds the external port
    #[error("External port {external_port}/{protocol} is held by another host")]
    PortConflict {
        /// Transport protocol
        protocol: Protocol,
        /// Contested external port
        external_port: u16,
    },

    /// Alternate-port budget exhausted
    #[error("NAT traversal unavailable for {protocol} port {internal_port} after {attempts} attempts")]
    MappingUnavailable {
        /// Transport protocol
        protocol: Protocol,
        /// Internal port that could not be exposed
        internal_port: u16,
        /// External ports tried
        attempts: u32,
    },

    /// The gateway refused the action for a reason other than a conflict
    #[error("Gateway rejected request: {0}")]
    Rejected(String),

    /// No mapping is tracked under this key
    #[error("No mapping tracked for {protocol} port {external_port}")]
    UnknownMapping {
        /// Transport protocol
        protocol: Protocol,
        /// External port
        external_port: u16,
    },

    /// The requested mapping cannot be expressed
    #[error("Invalid mapping spec: {0}")]
    InvalidSpec(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MappingError {
    /// Worth retrying on the next reconciliation tick
    pub fn is_transient(&self) -> bool {
        matches!(self, MappingError::GatewayUnreachable(_))
    }

    /// Equivalent to having no usable gateway
    pub fn means_no_gateway(&self) -> bool {
        matches!(
            self,
            MappingError::NotFound | MappingError::MalformedResponse(_)
        )
    }
}
