//! Reachability signal and the pluggable fallback channel
//!
//! When NAT traversal cannot make the host directly reachable, the host
//! application switches to whatever relay or manual path it has. The subsystem
//! does not know that path; it only tells the [`FallbackChannel`] why.

use super::types::{MappingKey, Protocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tracing::warn;

/// Why direct connectivity is unavailable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackReason {
    /// No UPnP gateway answered discovery
    NoGateway,
    /// Every external port tried for this mapping was taken
    MappingUnavailable {
        /// Transport protocol
        protocol: Protocol,
        /// Internal port that could not be exposed
        internal_port: u16,
    },
    /// The gateway's WAN address is in the carrier-grade NAT range
    CarrierGradeNat(IpAddr),
    /// The gateway's WAN address is itself private
    DoubleNat(IpAddr),
    /// A gateway exists but holds no mapping for us
    NoActiveMapping,
    /// The gateway would not report its external address
    ExternalAddressUnknown,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoGateway => write!(f, "no UPnP gateway"),
            FallbackReason::MappingUnavailable {
                protocol,
                internal_port,
            } => write!(f, "no external port available for {} {}", protocol, internal_port),
            FallbackReason::CarrierGradeNat(ip) => write!(f, "carrier-grade NAT ({})", ip),
            FallbackReason::DoubleNat(ip) => write!(f, "gateway is behind another NAT ({})", ip),
            FallbackReason::NoActiveMapping => write!(f, "no active port mapping"),
            FallbackReason::ExternalAddressUnknown => write!(f, "external address unknown"),
        }
    }
}

/// Whether peers can reach this host directly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    /// Advertise `external_ip` with these forwarded ports
    Direct {
        /// Gateway WAN address
        external_ip: IpAddr,
        /// Ports currently forwarded
        ports: Vec<MappingKey>,
    },
    /// Use relay or manual connectivity
    Fallback {
        /// Why
        reason: FallbackReason,
    },
}

impl Reachability {
    /// Directly reachable
    pub fn is_direct(&self) -> bool {
        matches!(self, Reachability::Direct { .. })
    }
}

/// Hook into the host application's relay/manual connectivity path
pub trait FallbackChannel: Send + Sync {
    /// NAT traversal is unavailable for `reason`
    fn engage(&self, reason: &FallbackReason);
}

/// Fallback channel that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFallback;

impl FallbackChannel for LogFallback {
    fn engage(&self, reason: &FallbackReason) {
        warn!(
            "NAT traversal unavailable ({}); use relay or manual connectivity",
            reason
        );
    }
}
