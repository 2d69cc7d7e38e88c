// In-memory gateway and locator used by the connectivity tests

use crate::connectivity::{
    FallbackChannel, FallbackReason, GatewayClient, GatewayDescriptor, GatewayLocator,
    GrantedMapping, LeaseSettings, MappingEntry, MappingError, MappingKey, MappingRequest,
    Protocol,
};
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);
pub const OTHER_HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 77);
pub const PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);

pub fn test_settings() -> LeaseSettings {
    LeaseSettings {
        discovery_timeout: Duration::from_secs(1),
        call_timeout: Duration::from_secs(1),
        renewal_threshold: 0.5,
        max_port_attempts: 8,
        permanent_refresh: Duration::from_secs(3600),
        description_tag: "portlease".to_string(),
        purge_stale_mappings: false,
        internal_host: Some(HOST),
    }
}

#[derive(Default)]
struct FakeState {
    table: Vec<MappingEntry>,
    lease_cap: Option<Duration>,
    silent_cap: bool,
    hide_leases: bool,
    grant_permanent: bool,
    unreachable: bool,
    delay: Option<Duration>,
    table_delay: Option<Duration>,
    external_ip: Option<IpAddr>,
    add_calls: Vec<MappingRequest>,
    delete_calls: Vec<MappingKey>,
}

/// Gateway that keeps its mapping table in memory
pub struct FakeGateway {
    descriptor: GatewayDescriptor,
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new(control_url: &str) -> Arc<Self> {
        Arc::new(Self {
            descriptor: GatewayDescriptor {
                addr: "192.168.1.1:5000".parse().unwrap(),
                control_url: control_url.to_string(),
                service_type: "urn:schemas-upnp-org:device:InternetGatewayDevice:1".to_string(),
                discovered_at: Utc::now(),
            },
            state: Mutex::new(FakeState {
                external_ip: Some(IpAddr::V4(PUBLIC_IP)),
                ..FakeState::default()
            }),
        })
    }

    /// Gateway caps every lease at `cap`
    pub fn set_lease_cap(&self, cap: Duration) {
        self.state.lock().unwrap().lease_cap = Some(cap);
    }

    /// The add answer echoes the requested lease; only the table shows the cap
    pub fn set_silent_cap(&self, silent: bool) {
        self.state.lock().unwrap().silent_cap = silent;
    }

    /// Table rows always list lease 0
    pub fn set_hide_leases(&self, hide: bool) {
        self.state.lock().unwrap().hide_leases = hide;
    }

    /// Gateway only grants permanent mappings
    pub fn set_grant_permanent(&self, permanent: bool) {
        self.state.lock().unwrap().grant_permanent = permanent;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Every add and delete blocks this long first
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Every table read blocks this long first
    pub fn set_table_delay(&self, delay: Duration) {
        self.state.lock().unwrap().table_delay = Some(delay);
    }

    pub fn set_external_ip(&self, ip: IpAddr) {
        self.state.lock().unwrap().external_ip = Some(ip);
    }

    /// Another LAN host holds `port`
    pub fn occupy(&self, protocol: Protocol, port: u16, host: Ipv4Addr) {
        self.insert_entry(MappingEntry {
            protocol,
            external_port: port,
            internal_client: host.to_string(),
            internal_port: port,
            description: "someone else".to_string(),
            lease: Duration::ZERO,
        });
    }

    pub fn insert_entry(&self, entry: MappingEntry) {
        self.state.lock().unwrap().table.push(entry);
    }

    /// Router reboot: the table is lost
    pub fn restart(&self) {
        self.state.lock().unwrap().table.clear();
    }

    pub fn entry(&self, protocol: Protocol, port: u16) -> Option<MappingEntry> {
        let key = MappingKey::new(protocol, port);
        self.state
            .lock()
            .unwrap()
            .table
            .iter()
            .find(|e| e.key() == key)
            .cloned()
    }

    pub fn table_len(&self) -> usize {
        self.state.lock().unwrap().table.len()
    }

    pub fn add_calls(&self) -> Vec<MappingRequest> {
        self.state.lock().unwrap().add_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<MappingKey> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    fn pause(&self) {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }

    fn pause_table(&self) {
        let delay = self.state.lock().unwrap().table_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl GatewayClient for FakeGateway {
    fn descriptor(&self) -> &GatewayDescriptor {
        &self.descriptor
    }

    fn add_mapping(&self, request: &MappingRequest) -> Result<GrantedMapping, MappingError> {
        self.pause();
        let mut state = self.state.lock().unwrap();
        state.add_calls.push(request.clone());
        if state.unreachable {
            return Err(MappingError::GatewayUnreachable("connection refused".to_string()));
        }

        let key = MappingKey::new(request.protocol, request.external_port);
        let host = request.internal.ip().to_string();
        if let Some(existing) = state.table.iter().find(|e| e.key() == key) {
            if existing.internal_client != host {
                return Err(MappingError::PortConflict {
                    protocol: request.protocol,
                    external_port: request.external_port,
                });
            }
        }

        let lease = if state.grant_permanent {
            Duration::ZERO
        } else {
            match state.lease_cap {
                Some(cap) if request.lease.is_zero() || request.lease > cap => cap,
                _ => request.lease,
            }
        };

        state.table.retain(|e| e.key() != key);
        state.table.push(MappingEntry {
            protocol: request.protocol,
            external_port: request.external_port,
            internal_client: host,
            internal_port: request.internal.port(),
            description: request.description.clone(),
            lease,
        });

        Ok(GrantedMapping {
            protocol: request.protocol,
            external_port: request.external_port,
            internal: request.internal,
            lease: if state.silent_cap { request.lease } else { lease },
        })
    }

    fn delete_mapping(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError> {
        self.pause();
        let mut state = self.state.lock().unwrap();
        let key = MappingKey::new(protocol, external_port);
        state.delete_calls.push(key);
        if state.unreachable {
            return Err(MappingError::GatewayUnreachable("connection refused".to_string()));
        }
        state.table.retain(|e| e.key() != key);
        Ok(())
    }

    fn external_address(&self) -> Result<IpAddr, MappingError> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(MappingError::GatewayUnreachable("connection refused".to_string()));
        }
        state
            .external_ip
            .ok_or_else(|| MappingError::MalformedResponse("no external address".to_string()))
    }

    fn mapping_entry(&self, index: u32) -> Result<Option<MappingEntry>, MappingError> {
        self.pause_table();
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(MappingError::GatewayUnreachable("connection refused".to_string()));
        }
        let hide_leases = state.hide_leases;
        Ok(state.table.get(index as usize).cloned().map(|mut entry| {
            if hide_leases {
                entry.lease = Duration::ZERO;
            }
            entry
        }))
    }
}

/// Locator returning whatever gateway is currently "plugged in"
#[derive(Default)]
pub struct FakeLocator {
    gateway: Mutex<Option<Arc<FakeGateway>>>,
    delay: Mutex<Option<Duration>>,
    discover_calls: AtomicUsize,
}

impl FakeLocator {
    pub fn with_gateway(gateway: Arc<FakeGateway>) -> Arc<Self> {
        let locator = Self::default();
        *locator.gateway.lock().unwrap() = Some(gateway);
        Arc::new(locator)
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_gateway(&self, gateway: Option<Arc<FakeGateway>>) {
        *self.gateway.lock().unwrap() = gateway;
    }

    /// Discovery blocks this long before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }
}

impl GatewayLocator for FakeLocator {
    fn discover(&self, _timeout: Duration) -> Result<Arc<dyn GatewayClient>, MappingError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        match self.gateway.lock().unwrap().clone() {
            Some(gateway) => {
                let client: Arc<dyn GatewayClient> = gateway;
                Ok(client)
            }
            None => Err(MappingError::NotFound),
        }
    }
}

/// Fallback channel remembering every reason it was engaged for
#[derive(Default)]
pub struct RecordingFallback {
    reasons: Mutex<Vec<FallbackReason>>,
}

impl RecordingFallback {
    pub fn reasons(&self) -> Vec<FallbackReason> {
        self.reasons.lock().unwrap().clone()
    }
}

impl FallbackChannel for RecordingFallback {
    fn engage(&self, reason: &FallbackReason) {
        self.reasons.lock().unwrap().push(reason.clone());
    }
}
