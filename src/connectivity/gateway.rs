//! Gateway seams: locating an Internet Gateway Device and talking to it
//!
//! Both traits are synchronous. Callers on the async side go through
//! [`call_with_timeout`] and [`discover_with_timeout`], which run the call on
//! the blocking pool and give up after a hard deadline so no caller waits on a
//! silent router.

use super::types::{
    GatewayDescriptor, GrantedMapping, MappingEntry, MappingError, MappingKey, MappingRequest,
    Protocol,
};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Remote address for the local routing table lookup (nothing is sent)
const ROUTING_PROBE_ADDR: &str = "8.8.8.8:80";

/// Upper bound on table rows inspected when reading a lease back
pub const LEASE_READ_BACK_LIMIT: u32 = 128;

/// Control actions against one located gateway
pub trait GatewayClient: Send + Sync {
    /// The gateway this client is bound to
    fn descriptor(&self) -> &GatewayDescriptor;

    /// AddPortMapping.
    ///
    /// Re-requesting a port already held by the same internal host refreshes
    /// the lease. A port held by a different host fails with
    /// [`MappingError::PortConflict`]. The returned lease is the one the
    /// gateway accepted; [`GatewayClient::listed_lease`] reads back what it
    /// actually keeps.
    fn add_mapping(&self, request: &MappingRequest) -> Result<GrantedMapping, MappingError>;

    /// DeletePortMapping
    fn delete_mapping(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError>;

    /// GetExternalIPAddress
    fn external_address(&self) -> Result<IpAddr, MappingError>;

    /// GetGenericPortMappingEntry; `Ok(None)` past the end of the table
    fn mapping_entry(&self, index: u32) -> Result<Option<MappingEntry>, MappingError>;

    /// Lease the gateway lists for `key` forwarding to `host`, if listed
    fn listed_lease(
        &self,
        key: MappingKey,
        host: Ipv4Addr,
    ) -> Result<Option<Duration>, MappingError> {
        let table = read_mapping_table(self, LEASE_READ_BACK_LIMIT)?;
        Ok(table
            .iter()
            .find(|entry| entry.key() == key && entry.internal_host() == Some(host))
            .map(|entry| entry.lease))
    }
}

/// Discovery of a gateway on the local network
pub trait GatewayLocator: Send + Sync {
    /// Find a gateway within `timeout`
    fn discover(&self, timeout: Duration) -> Result<Arc<dyn GatewayClient>, MappingError>;
}

/// The current gateway: a client plus the discovery generation that produced it
#[derive(Clone)]
pub struct GatewayHandle {
    /// Increases with every successful discovery
    pub generation: u64,
    /// Client bound to the discovered gateway
    pub client: Arc<dyn GatewayClient>,
}

impl GatewayHandle {
    /// Descriptor of the underlying gateway
    pub fn descriptor(&self) -> &GatewayDescriptor {
        self.client.descriptor()
    }
}

impl fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayHandle")
            .field("generation", &self.generation)
            .field("control_url", &self.descriptor().control_url)
            .finish()
    }
}

/// Run one gateway call on the blocking pool, failing with
/// `GatewayUnreachable` once `timeout` elapses
pub async fn call_with_timeout<T, F>(
    client: Arc<dyn GatewayClient>,
    timeout: Duration,
    call: F,
) -> Result<T, MappingError>
where
    T: Send + 'static,
    F: FnOnce(&dyn GatewayClient) -> Result<T, MappingError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || call(client.as_ref()));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(MappingError::Internal(format!("Task join error: {}", e))),
        Err(_) => Err(MappingError::GatewayUnreachable(format!(
            "no answer within {:?}",
            timeout
        ))),
    }
}

/// Run discovery on the blocking pool; returns within `timeout` plus scheduling slack
pub async fn discover_with_timeout(
    locator: Arc<dyn GatewayLocator>,
    timeout: Duration,
) -> Result<Arc<dyn GatewayClient>, MappingError> {
    let task = tokio::task::spawn_blocking(move || locator.discover(timeout));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(MappingError::Internal(format!("Task join error: {}", e))),
        Err(_) => {
            debug!("Gateway discovery did not finish within {:?}", timeout);
            Err(MappingError::NotFound)
        }
    }
}

/// Read the gateway's mapping table, at most `limit` entries
///
/// Stops at the first index the gateway reports as out of range.
pub fn read_mapping_table<C: GatewayClient + ?Sized>(
    client: &C,
    limit: u32,
) -> Result<Vec<MappingEntry>, MappingError> {
    let mut entries = Vec::new();
    for index in 0..limit {
        match client.mapping_entry(index)? {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }
    Ok(entries)
}

/// Lease to track for a grant, given what the table listed for it
///
/// A zero in the table next to a finite accepted lease means the gateway does
/// not report leases, so the accepted one stands.
pub fn effective_lease(accepted: Duration, listed: Option<Duration>) -> Duration {
    match listed {
        Some(lease) if !lease.is_zero() || accepted.is_zero() => lease,
        _ => accepted,
    }
}

/// Local IPv4 address the OS would use to reach the internet
pub fn local_ipv4_for_gateway() -> Result<Ipv4Addr, MappingError> {
    let target: SocketAddr = ROUTING_PROBE_ADDR
        .parse()
        .map_err(|e| MappingError::Internal(format!("Bad routing probe address: {}", e)))?;
    local_ipv4_towards(target)
}

/// Local IPv4 address the OS would use to reach `target`
///
/// Connecting a UDP socket only consults the routing table; no packet leaves
/// the host.
pub fn local_ipv4_towards(target: SocketAddr) -> Result<Ipv4Addr, MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| MappingError::Internal(format!("Failed to create socket: {}", e)))?;

    socket
        .connect(target)
        .map_err(|e| MappingError::Internal(format!("Failed to connect: {}", e)))?;

    let local_addr = socket
        .local_addr()
        .map_err(|e| MappingError::Internal(format!("Failed to get local address: {}", e)))?;

    match local_addr.ip() {
        IpAddr::V4(ipv4) if !ipv4.is_unspecified() => Ok(ipv4),
        IpAddr::V4(_) => Err(MappingError::Internal(
            "No route to the gateway network".to_string(),
        )),
        IpAddr::V6(_) => Err(MappingError::Internal(
            "UPnP requires IPv4 address".to_string(),
        )),
    }
}
