//! UPnP IGD (Internet Gateway Device) gateway implementation
//!
//! Discovery sends an SSDP multicast search and follows the first device that
//! answers with a usable WAN connection service description. Control actions
//! are SOAP calls against that service's control URL. Both are provided by
//! `igd-next`; this module adapts them to the [`GatewayLocator`] and
//! [`GatewayClient`] contracts:
//!
//! - `AddPortMapping` conflicts are resolved against the gateway's own table so
//!   a refresh by the same host is never reported as a conflict
//! - gateways that only accept permanent leases get one retry with lease 0
//!
//! Reading the granted lease back is a separate call, see
//! [`GatewayClient::listed_lease`].

use super::gateway::{read_mapping_table, GatewayClient, GatewayLocator, LEASE_READ_BACK_LIMIT};
use super::types::{
    GatewayDescriptor, GrantedMapping, MappingEntry, MappingError, MappingRequest, Protocol,
};
use chrono::Utc;
use igd_next::{
    AddPortError, GetExternalIpError, GetGenericPortMappingEntryError, PortMappingEntry,
    PortMappingProtocol, RemovePortError, RequestError, SearchError, SearchOptions,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Device type searched for during discovery
const IGD_DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Action a gateway must expose to be usable
const REQUIRED_ACTION: &str = "AddPortMapping";

/// UPnP error code for an out-of-range GetGenericPortMappingEntry index
const ARRAY_INDEX_INVALID: u16 = 713;

/// Gateway locator backed by SSDP discovery
#[derive(Debug, Clone, Copy, Default)]
pub struct IgdLocator;

impl IgdLocator {
    /// Locator searching from the default bind address
    pub fn new() -> Self {
        Self
    }
}

impl GatewayLocator for IgdLocator {
    fn discover(&self, timeout: Duration) -> Result<Arc<dyn GatewayClient>, MappingError> {
        debug!("Searching for UPnP IGD gateway (timeout {:?})...", timeout);

        let options = SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        };

        let gateway = igd_next::search_gateway(options).map_err(map_search_error)?;

        if !gateway.control_schema.contains_key(REQUIRED_ACTION) {
            warn!(
                "Gateway at {} does not offer {}; ignoring it",
                gateway.addr, REQUIRED_ACTION
            );
            return Err(MappingError::MalformedResponse(format!(
                "service description at {} lacks {}",
                gateway.addr, REQUIRED_ACTION
            )));
        }

        let descriptor = GatewayDescriptor {
            addr: gateway.addr,
            control_url: absolute_control_url(gateway.addr, &gateway.control_url),
            service_type: IGD_DEVICE_TYPE.to_string(),
            discovered_at: Utc::now(),
        };

        info!("Found UPnP gateway: {}", descriptor.control_url);

        Ok(Arc::new(IgdClient {
            gateway,
            descriptor,
        }))
    }
}

/// Control client bound to one discovered gateway
pub struct IgdClient {
    gateway: igd_next::Gateway,
    descriptor: GatewayDescriptor,
}

impl IgdClient {
    fn add_port(&self, request: &MappingRequest, lease_secs: u32) -> Result<(), AddPortError> {
        self.gateway.add_port(
            to_igd_protocol(request.protocol),
            request.external_port,
            SocketAddr::V4(request.internal),
            lease_secs,
            &request.description,
        )
    }

    /// Add with the permanent-lease fallback; returns the lease the gateway accepted
    fn add_accepting_permanent(
        &self,
        request: &MappingRequest,
        lease_secs: u32,
    ) -> Result<u32, AddPortError> {
        match self.add_port(request, lease_secs) {
            Ok(()) => Ok(lease_secs),
            Err(AddPortError::OnlyPermanentLeasesSupported) if lease_secs != 0 => {
                debug!(
                    "Gateway only supports permanent leases, retrying {}/{} with lease 0",
                    request.protocol, request.external_port
                );
                self.add_port(request, 0).map(|()| 0)
            }
            Err(e) => Err(e),
        }
    }

    /// The gateway reported the port in use: refresh it if it is ours, otherwise conflict
    fn resolve_port_in_use(
        &self,
        request: &MappingRequest,
        lease_secs: u32,
    ) -> Result<u32, MappingError> {
        check_own_holding(read_mapping_table(self, LEASE_READ_BACK_LIMIT), request)?;

        debug!(
            "{}/{} already forwarded to us; replacing the entry to refresh its lease",
            request.protocol, request.external_port
        );
        self.delete_mapping(request.protocol, request.external_port)?;
        self.add_accepting_permanent(request, lease_secs)
            .map_err(|e| map_add_error(request, e))
    }
}

impl GatewayClient for IgdClient {
    fn descriptor(&self) -> &GatewayDescriptor {
        &self.descriptor
    }

    fn add_mapping(&self, request: &MappingRequest) -> Result<GrantedMapping, MappingError> {
        let lease_secs = u32::try_from(request.lease.as_secs()).unwrap_or(u32::MAX);

        let accepted_secs = match self.add_accepting_permanent(request, lease_secs) {
            Ok(accepted) => accepted,
            Err(AddPortError::PortInUse) => self.resolve_port_in_use(request, lease_secs)?,
            Err(e) => return Err(map_add_error(request, e)),
        };

        Ok(GrantedMapping {
            protocol: request.protocol,
            external_port: request.external_port,
            internal: request.internal,
            lease: Duration::from_secs(u64::from(accepted_secs)),
        })
    }

    fn delete_mapping(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError> {
        match self
            .gateway
            .remove_port(to_igd_protocol(protocol), external_port)
        {
            Ok(()) => Ok(()),
            Err(RemovePortError::NoSuchPortMapping) => {
                debug!("{}/{} was already gone from the gateway", protocol, external_port);
                Ok(())
            }
            Err(RemovePortError::RequestError(e)) => Err(map_request_error(e)),
            Err(other) => Err(MappingError::Rejected(format!(
                "DeletePortMapping {}/{} failed: {}",
                protocol, external_port, other
            ))),
        }
    }

    fn external_address(&self) -> Result<IpAddr, MappingError> {
        self.gateway.get_external_ip().map_err(|e| match e {
            GetExternalIpError::RequestError(e) => map_request_error(e),
            other => MappingError::Rejected(format!("GetExternalIPAddress failed: {}", other)),
        })
    }

    fn mapping_entry(&self, index: u32) -> Result<Option<MappingEntry>, MappingError> {
        match self.gateway.get_generic_port_mapping_entry(index) {
            Ok(entry) => Ok(Some(from_igd_entry(entry))),
            Err(GetGenericPortMappingEntryError::SpecifiedArrayIndexInvalid) => Ok(None),
            Err(GetGenericPortMappingEntryError::RequestError(RequestError::ErrorCode(
                ARRAY_INDEX_INVALID,
                _,
            ))) => Ok(None),
            Err(GetGenericPortMappingEntryError::RequestError(e)) => Err(map_request_error(e)),
            Err(other) => Err(MappingError::Rejected(format!(
                "GetGenericPortMappingEntry failed: {}",
                other
            ))),
        }
    }
}

fn to_igd_protocol(protocol: Protocol) -> PortMappingProtocol {
    match protocol {
        Protocol::TCP => PortMappingProtocol::TCP,
        Protocol::UDP => PortMappingProtocol::UDP,
    }
}

fn from_igd_protocol(protocol: PortMappingProtocol) -> Protocol {
    match protocol {
        PortMappingProtocol::TCP => Protocol::TCP,
        PortMappingProtocol::UDP => Protocol::UDP,
    }
}

fn from_igd_entry(entry: PortMappingEntry) -> MappingEntry {
    MappingEntry {
        protocol: from_igd_protocol(entry.protocol),
        external_port: entry.external_port,
        internal_client: entry.internal_client,
        internal_port: entry.internal_port,
        description: entry.port_mapping_description,
        lease: Duration::from_secs(u64::from(entry.lease_duration)),
    }
}

fn absolute_control_url(addr: SocketAddr, control_url: &str) -> String {
    if control_url.starts_with("http://") || control_url.starts_with("https://") {
        control_url.to_string()
    } else if control_url.starts_with('/') {
        format!("http://{}{}", addr, control_url)
    } else {
        format!("http://{}/{}", addr, control_url)
    }
}

/// Table row for `protocol`/`external_port`, if listed
pub(crate) fn find_entry(
    entries: &[MappingEntry],
    protocol: Protocol,
    external_port: u16,
) -> Option<&MappingEntry> {
    entries
        .iter()
        .find(|entry| entry.protocol == protocol && entry.external_port == external_port)
}

/// Entry forwards to `host`
pub(crate) fn held_by(entry: &MappingEntry, host: Ipv4Addr) -> bool {
    entry.internal_host() == Some(host)
}

/// After a PortInUse answer: `Ok` only when the table shows the port already
/// forwarded to the requesting host. A table that cannot be read is an error
/// of its own, not evidence of a conflict.
fn check_own_holding(
    table: Result<Vec<MappingEntry>, MappingError>,
    request: &MappingRequest,
) -> Result<(), MappingError> {
    let table = table?;
    let holder = find_entry(&table, request.protocol, request.external_port);
    if holder.is_some_and(|entry| held_by(entry, *request.internal.ip())) {
        Ok(())
    } else {
        Err(MappingError::PortConflict {
            protocol: request.protocol,
            external_port: request.external_port,
        })
    }
}

fn map_search_error(err: SearchError) -> MappingError {
    match &err {
        SearchError::InvalidResponse | SearchError::Utf8Error(_) | SearchError::XmlError(_) => {
            warn!("Gateway answered discovery with an unusable description: {}", err);
            MappingError::MalformedResponse(err.to_string())
        }
        _ => {
            warn!("No UPnP gateway found: {}", err);
            MappingError::NotFound
        }
    }
}

fn map_add_error(request: &MappingRequest, err: AddPortError) -> MappingError {
    match err {
        AddPortError::PortInUse => MappingError::PortConflict {
            protocol: request.protocol,
            external_port: request.external_port,
        },
        AddPortError::RequestError(e) => map_request_error(e),
        other => {
            warn!(
                "UPnP AddPortMapping {}/{} refused: {}",
                request.protocol, request.external_port, other
            );
            MappingError::Rejected(format!("AddPortMapping failed: {}", other))
        }
    }
}

fn map_request_error(err: RequestError) -> MappingError {
    match err {
        RequestError::InvalidResponse(body) => MappingError::MalformedResponse(body),
        RequestError::ErrorCode(code, message) => {
            MappingError::Rejected(format!("UPnP error {}: {}", code, message))
        }
        other => MappingError::GatewayUnreachable(other.to_string()),
    }
}
