//! CGNAT (Carrier-Grade NAT) and double-NAT detection
//!
//! A port mapping on the local router only helps if the router's WAN address
//! is public. When the gateway reports a shared (RFC 6598) or private address,
//! there is another NAT upstream and peers still cannot reach us.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, warn};

/// CGNAT (RFC 6598) IP range: 100.64.0.0/10
const CGNAT_RANGE_START: u32 = 0x64400000; // 100.64.0.0
const CGNAT_RANGE_END: u32 = 0x647FFFFF; // 100.127.255.255

/// What kind of address the gateway reports as its external address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalAddressKind {
    /// Routable from the internet
    Public,
    /// Inside 100.64.0.0/10
    CarrierGrade,
    /// RFC 1918, loopback, link-local or unspecified
    Private,
}

/// Classify the gateway's external address
///
/// # Example
///
/// ```
/// use portlease::connectivity::{classify_external_ip, ExternalAddressKind};
///
/// assert_eq!(classify_external_ip("203.0.113.5".parse().unwrap()), ExternalAddressKind::Public);
/// assert_eq!(classify_external_ip("100.64.0.1".parse().unwrap()), ExternalAddressKind::CarrierGrade);
/// assert_eq!(classify_external_ip("192.168.0.2".parse().unwrap()), ExternalAddressKind::Private);
/// ```
pub fn classify_external_ip(external_ip: IpAddr) -> ExternalAddressKind {
    if detect_cgnat(external_ip) {
        ExternalAddressKind::CarrierGrade
    } else if is_private_ip(external_ip) {
        warn!(
            "Gateway reports private external address {}; router is behind another NAT",
            external_ip
        );
        ExternalAddressKind::Private
    } else {
        ExternalAddressKind::Public
    }
}

/// Detect if an external IP address is within CGNAT range
pub fn detect_cgnat(external_ip: IpAddr) -> bool {
    match external_ip {
        IpAddr::V4(ipv4) => {
            let ip_u32 = u32::from(ipv4);
            let is_cgnat = (CGNAT_RANGE_START..=CGNAT_RANGE_END).contains(&ip_u32);

            if is_cgnat {
                warn!(
                    "CGNAT detected: External IP {} is in range 100.64.0.0/10. \
                     Port mappings on the local gateway will not make us reachable.",
                    ipv4
                );
            } else {
                debug!("External IP {} is not in CGNAT range", ipv4);
            }

            is_cgnat
        }
        IpAddr::V6(_) => false,
    }
}

/// Check if an IP is a private/local address
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            let first = ipv6.segments()[0];
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}
