//! Lease manager: owns the desired port mappings and drives them against the
//! current gateway
//!
//! All mapping mutations and the gateway swap happen under one async mutex, so
//! `ensure`, `release`, `reconcile` and re-discovery never race on a mapping.
//! Gateway calls run on the blocking pool with a per-call deadline; the caller
//! only ever awaits.

use super::cgnat::{classify_external_ip, ExternalAddressKind};
use super::fallback::{FallbackChannel, FallbackReason, LogFallback, Reachability};
use super::gateway::{
    call_with_timeout, discover_with_timeout, effective_lease, local_ipv4_towards,
    read_mapping_table, GatewayClient, GatewayHandle, GatewayLocator,
};
use super::registry::MappingRegistry;
use super::types::{
    GatewayDescriptor, GrantedMapping, MappingEntry, MappingError, MappingKey, MappingRequest,
    MappingSpec, MappingState, MappingStatus, PortMapping, Protocol,
};
use crate::config::NatConfig;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Date format stamped into mapping descriptions
const STAMP_FORMAT: &str = "%Y-%m-%d";

/// Upper bound on gateway table rows inspected by the stale sweep
const TABLE_SCAN_LIMIT: u32 = 128;

/// Where alternate-port probing wraps to after 65535
const LOWEST_ALTERNATE_PORT: u16 = 1024;

/// Tunables of the lease manager
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Bound for one discovery cycle
    pub discovery_timeout: Duration,
    /// Bound for one gateway call
    pub call_timeout: Duration,
    /// Renew below this fraction of the granted lease
    pub renewal_threshold: f64,
    /// External ports tried per mapping
    pub max_port_attempts: u32,
    /// Refresh cadence for permanent grants
    pub permanent_refresh: Duration,
    /// Prefix stamped on descriptions
    pub description_tag: String,
    /// Sweep leftovers of earlier runs after discovery
    pub purge_stale_mappings: bool,
    /// Configured LAN address, if any
    pub internal_host: Option<Ipv4Addr>,
}

impl From<&NatConfig> for LeaseSettings {
    fn from(config: &NatConfig) -> Self {
        Self {
            discovery_timeout: config.discovery_timeout(),
            call_timeout: config.call_timeout(),
            renewal_threshold: config.renewal_threshold,
            max_port_attempts: config.max_port_attempts,
            permanent_refresh: config.permanent_refresh(),
            description_tag: config.description_tag.clone(),
            purge_stale_mappings: config.purge_stale_mappings,
            internal_host: config.internal_host,
        }
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::from(&NatConfig::default())
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Live mappings looked at
    pub examined: usize,
    /// Requested or expired mappings realized
    pub created: usize,
    /// Leases renewed
    pub renewed: usize,
    /// Leases found expired
    pub expired: usize,
    /// Calls that failed with `GatewayUnreachable`
    pub unreachable: usize,
    /// Calls that failed otherwise
    pub failed: usize,
    /// Mappings left alone because no gateway is known
    pub skipped: usize,
}

impl ReconcileReport {
    /// Every gateway call of this pass timed out or hit a transport failure
    pub fn gateway_unreachable(&self) -> bool {
        self.unreachable > 0 && self.created + self.renewed == 0
    }

    /// At least one gateway call succeeded
    pub fn gateway_answered(&self) -> bool {
        self.created + self.renewed > 0
    }
}

/// Outcome of the shutdown release pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Mappings removed cleanly
    pub released: usize,
    /// Mappings whose gateway delete failed or never ran
    pub failed: usize,
    /// The deadline cut the pass short
    pub timed_out: bool,
}

struct LeaseState {
    registry: MappingRegistry,
    gateway: Option<GatewayHandle>,
    generation: u64,
    last_control_url: Option<String>,
    external_ip: Option<IpAddr>,
}

/// Port mapping lease manager
///
/// Cheap to clone; clones share state.
///
/// # Example
///
/// ```no_run
/// use std::net::Ipv4Addr;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use portlease::connectivity::{IgdLocator, LeaseManager, LeaseSettings, MappingSpec, Protocol};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = LeaseManager::new(Arc::new(IgdLocator::new()), LeaseSettings::default());
/// let _ = manager.discover().await;
///
/// let spec = MappingSpec::new(
///     Protocol::TCP,
///     Ipv4Addr::new(192, 168, 1, 42),
///     51413,
///     Duration::from_secs(7200),
/// );
/// let status = manager.ensure(spec).await?;
/// println!("{:?} on external port {}", status.state, status.external_port);
///
/// manager.shutdown(Duration::from_secs(5)).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LeaseManager {
    state: Arc<Mutex<LeaseState>>,
    locator: Arc<dyn GatewayLocator>,
    fallback: Arc<dyn FallbackChannel>,
    settings: Arc<LeaseSettings>,
}

impl LeaseManager {
    /// Create a manager with no gateway yet
    pub fn new(locator: Arc<dyn GatewayLocator>, settings: LeaseSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(LeaseState {
                registry: MappingRegistry::new(),
                gateway: None,
                generation: 0,
                last_control_url: None,
                external_ip: None,
            })),
            locator,
            fallback: Arc::new(LogFallback),
            settings: Arc::new(settings),
        }
    }

    /// Notify `fallback` whenever direct connectivity is unavailable
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackChannel>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Current tunables
    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    /// Locate a gateway and make it current
    ///
    /// Any previously held gateway client is invalidated, whether or not this
    /// discovery succeeds. If the new gateway has a different control URL,
    /// every live mapping goes back to `Requested`.
    pub async fn discover(&self) -> Result<GatewayDescriptor, MappingError> {
        info!("Discovering UPnP gateway...");
        let result =
            discover_with_timeout(self.locator.clone(), self.settings.discovery_timeout).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(client) => {
                let descriptor = client.descriptor().clone();
                self.install_gateway(&mut state, client);
                if self.settings.purge_stale_mappings {
                    self.purge_stale(&mut state).await;
                }
                Ok(descriptor)
            }
            Err(e) => {
                if let Some(old) = state.gateway.take() {
                    warn!(
                        "Dropping gateway {} after failed discovery",
                        old.descriptor().control_url
                    );
                }
                state.external_ip = None;
                warn!("Gateway discovery failed: {}", e);
                self.fallback.engage(&FallbackReason::NoGateway);
                Err(e)
            }
        }
    }

    /// Declare a desired mapping and realize it now if a gateway is known
    ///
    /// Without a gateway, or when the gateway is unreachable, the mapping is
    /// kept as `Requested` and `Ok` is returned; the next reconciliation picks
    /// it up. Declaring the same internal endpoint twice is idempotent.
    /// Re-declaring it with a different lease or description re-requests the
    /// current port at once; a different external port hint moves it.
    pub async fn ensure(&self, spec: MappingSpec) -> Result<MappingStatus, MappingError> {
        spec.validate()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut changed = false;

        let id = match state.registry.find_by_internal(
            spec.protocol,
            spec.internal_host,
            spec.internal_port,
        ) {
            Some(id) => {
                let Some(mapping) = state.registry.get_mut(id) else {
                    return Err(MappingError::Internal(format!("unknown mapping {}", id)));
                };
                if mapping.state == MappingState::Unavailable {
                    mapping.state = MappingState::Requested;
                }
                if mapping.spec != spec {
                    debug!("Updating declared mapping for {}", spec.internal_addr());
                    let moved =
                        mapping.spec.preferred_external_port() != spec.preferred_external_port();
                    mapping.spec = spec;
                    changed = true;
                    if moved {
                        self.move_to_preferred_port(&mut state, id).await?;
                    }
                }
                id
            }
            None => {
                let mut mapping = PortMapping::new(spec);
                mapping.external_port = first_free_port(
                    &state.registry,
                    mapping.spec.protocol,
                    mapping.external_port,
                    mapping.id,
                );
                info!(
                    "Declared mapping {} -> {} ({})",
                    mapping.key(),
                    mapping.spec.internal_addr(),
                    mapping.spec.description
                );
                state.registry.insert(mapping)?
            }
        };

        let needs_call = match state.registry.get_mut(id) {
            Some(mapping) => match mapping.state {
                MappingState::Active | MappingState::RenewalDue => {
                    if mapping.is_expired(now) {
                        mapping.state = MappingState::Expired;
                        true
                    } else {
                        changed
                    }
                }
                MappingState::Requested | MappingState::Expired => true,
                MappingState::Unavailable | MappingState::Removed => false,
            },
            None => false,
        };

        if needs_call {
            match state.gateway.clone() {
                None => debug!("No gateway yet; mapping stays Requested"),
                Some(gateway) => match self.acquire(&mut state, id, &gateway, now).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() || e.means_no_gateway() => {
                        debug!("Gateway unavailable ({}); mapping stays Requested", e);
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        state
            .registry
            .get(id)
            .map(|mapping| mapping.status(now))
            .ok_or_else(|| MappingError::Internal(format!("unknown mapping {}", id)))
    }

    /// Delete the mapping on the gateway and mark it `Removed`
    ///
    /// The mapping is `Removed` even if the delete fails; the failure is
    /// logged and the gateway lease is left to expire.
    pub async fn release(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError> {
        let mut state = self.state.lock().await;
        let Some(id) = state
            .registry
            .id_for(MappingKey::new(protocol, external_port))
        else {
            return Err(MappingError::UnknownMapping {
                protocol,
                external_port,
            });
        };
        self.release_id(&mut state, id).await;
        Ok(())
    }

    /// Re-request pending mappings and renew leases below the threshold
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconcile_at(Instant::now()).await
    }

    /// [`LeaseManager::reconcile`] evaluated as of `now`
    pub async fn reconcile_at(&self, now: Instant) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut state = self.state.lock().await;
        let gateway = state.gateway.clone();
        let threshold = self.settings.renewal_threshold;
        let permanent_refresh = self.settings.permanent_refresh;

        for id in state.registry.live_ids() {
            let Some(mapping) = state.registry.get_mut(id) else {
                continue;
            };
            report.examined += 1;

            let renewing = match mapping.state {
                MappingState::Unavailable | MappingState::Removed => continue,
                MappingState::Active | MappingState::RenewalDue => {
                    if mapping.is_expired(now) {
                        warn!("Lease for {} expired before renewal", mapping.key());
                        mapping.state = MappingState::Expired;
                        report.expired += 1;
                        false
                    } else if mapping.needs_renewal(now, threshold, permanent_refresh) {
                        mapping.state = MappingState::RenewalDue;
                        true
                    } else {
                        continue;
                    }
                }
                MappingState::Requested | MappingState::Expired => false,
            };

            let Some(gateway) = gateway.as_ref() else {
                report.skipped += 1;
                continue;
            };

            match self.acquire(&mut state, id, gateway, now).await {
                Ok(()) if renewing => report.renewed += 1,
                Ok(()) => report.created += 1,
                Err(e) if e.is_transient() => report.unreachable += 1,
                Err(_) => report.failed += 1,
            }
        }

        debug!("Reconciliation finished: {:?}", report);
        report
    }

    /// Release every live mapping, returning no later than `deadline` from now
    ///
    /// Mappings not released in time are marked `Removed` locally and left to
    /// expire on the gateway.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let until = tokio::time::Instant::now() + deadline;

        let Ok(mut state) = tokio::time::timeout_at(until, self.state.lock()).await else {
            warn!(
                "Shutdown deadline {:?} reached while another operation held the mappings",
                deadline
            );
            report.timed_out = true;
            return report;
        };

        let live = state.registry.live_ids();
        debug!("Releasing {} live mappings", state.registry.live_count());
        for (done, id) in live.iter().enumerate() {
            match tokio::time::timeout_at(until, self.release_id(&mut state, *id)).await {
                Ok(true) => report.released += 1,
                Ok(false) => report.failed += 1,
                Err(_) => {
                    let abandoned = &live[done..];
                    warn!(
                        "Shutdown deadline {:?} reached; leaving {} mappings to expire",
                        deadline,
                        abandoned.len()
                    );
                    report.timed_out = true;
                    report.failed += abandoned.len();
                    for id in abandoned {
                        state.registry.mark_removed(*id);
                    }
                    break;
                }
            }
        }

        info!(
            "Port mapping shutdown: {} released, {} left to expire",
            report.released, report.failed
        );
        report
    }

    /// Snapshot of every mapping, `Removed` included
    pub async fn status(&self) -> Vec<MappingStatus> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state.registry.all().map(|m| m.status(now)).collect()
    }

    /// Snapshot of the live mapping claiming `protocol`/`external_port`
    pub async fn mapping_status(&self, protocol: Protocol, external_port: u16) -> Option<MappingStatus> {
        let state = self.state.lock().await;
        state
            .registry
            .lookup(MappingKey::new(protocol, external_port))
            .map(|m| m.status(Instant::now()))
    }

    /// Descriptor of the current gateway
    pub async fn gateway(&self) -> Option<GatewayDescriptor> {
        let state = self.state.lock().await;
        state.gateway.as_ref().map(|g| g.descriptor().clone())
    }

    /// A gateway is currently held
    pub async fn has_gateway(&self) -> bool {
        self.state.lock().await.gateway.is_some()
    }

    /// Some live mapping still needs a gateway, to be created or to be renewed
    ///
    /// Only `Unavailable` mappings are excluded; they wait for the application
    /// to declare them again.
    pub async fn wants_gateway(&self) -> bool {
        let state = self.state.lock().await;
        state
            .registry
            .live()
            .any(|m| m.state != MappingState::Unavailable)
    }

    /// Ask the gateway for its WAN address
    pub async fn current_external_address(&self) -> Result<IpAddr, MappingError> {
        let mut state = self.state.lock().await;
        let gateway = state.gateway.clone().ok_or(MappingError::NotFound)?;

        let ip = call_with_timeout(gateway.client, self.settings.call_timeout, |client| {
            client.external_address()
        })
        .await?;

        if state.external_ip != Some(ip) {
            info!("Gateway external address: {}", ip);
            match classify_external_ip(ip) {
                ExternalAddressKind::Public => {}
                ExternalAddressKind::CarrierGrade => {
                    self.fallback.engage(&FallbackReason::CarrierGradeNat(ip))
                }
                ExternalAddressKind::Private => self.fallback.engage(&FallbackReason::DoubleNat(ip)),
            }
        }
        state.external_ip = Some(ip);
        Ok(ip)
    }

    /// Whether the host should advertise itself as directly reachable
    pub async fn reachability(&self) -> Reachability {
        let (has_gateway, ports, cached) = {
            let state = self.state.lock().await;
            let ports: Vec<MappingKey> = state
                .registry
                .live()
                .filter(|m| m.state.is_granted())
                .map(|m| m.key())
                .collect();
            (state.gateway.is_some(), ports, state.external_ip)
        };

        if !has_gateway {
            return Reachability::Fallback {
                reason: FallbackReason::NoGateway,
            };
        }
        if ports.is_empty() {
            return Reachability::Fallback {
                reason: FallbackReason::NoActiveMapping,
            };
        }

        let external_ip = match cached {
            Some(ip) => ip,
            None => match self.current_external_address().await {
                Ok(ip) => ip,
                Err(e) => {
                    debug!("External address unavailable: {}", e);
                    return Reachability::Fallback {
                        reason: FallbackReason::ExternalAddressUnknown,
                    };
                }
            },
        };

        match classify_external_ip(external_ip) {
            ExternalAddressKind::Public => Reachability::Direct { external_ip, ports },
            ExternalAddressKind::CarrierGrade => Reachability::Fallback {
                reason: FallbackReason::CarrierGradeNat(external_ip),
            },
            ExternalAddressKind::Private => Reachability::Fallback {
                reason: FallbackReason::DoubleNat(external_ip),
            },
        }
    }

    fn install_gateway(&self, state: &mut LeaseState, client: Arc<dyn GatewayClient>) {
        state.generation += 1;
        let control_url = client.descriptor().control_url.clone();

        if state.last_control_url.as_deref() != Some(control_url.as_str()) {
            let mut reset = 0;
            for id in state.registry.live_ids() {
                if let Some(mapping) = state.registry.get_mut(id) {
                    if mapping.state != MappingState::Requested {
                        mapping.mark_requested();
                        reset += 1;
                    }
                }
            }
            if reset > 0 {
                info!(
                    "Gateway changed to {}; {} mappings will be recreated",
                    control_url, reset
                );
            }
        }

        info!(
            "Using gateway {} (generation {})",
            control_url, state.generation
        );
        state.last_control_url = Some(control_url);
        state.external_ip = None;
        state.gateway = Some(GatewayHandle {
            generation: state.generation,
            client,
        });
    }

    /// Claim an external port for mapping `id`, starting at its current port
    /// and moving up on conflicts until the attempt budget runs out
    async fn acquire(
        &self,
        state: &mut LeaseState,
        id: Uuid,
        gateway: &GatewayHandle,
        now: Instant,
    ) -> Result<(), MappingError> {
        let Some(mapping) = state.registry.get(id) else {
            return Err(MappingError::Internal(format!("unknown mapping {}", id)));
        };
        let spec = mapping.spec.clone();
        let mut port = mapping.external_port;
        let description = stamp_description(
            &self.settings.description_tag,
            Utc::now().date_naive(),
            &spec.description,
        );

        let mut attempts = 0;
        while attempts < self.settings.max_port_attempts {
            attempts += 1;
            let key = MappingKey::new(spec.protocol, port);

            if state.registry.is_claimed_by_other(key, id) {
                debug!("{} is held by another local mapping, skipping", key);
                port = next_port(port);
                continue;
            }

            let request = MappingRequest {
                protocol: spec.protocol,
                external_port: port,
                internal: spec.internal_addr(),
                lease: spec.lease,
                description: description.clone(),
            };
            debug!(
                "Requesting {} -> {} (lease {:?})",
                key, request.internal, request.lease
            );

            let result = call_with_timeout(
                gateway.client.clone(),
                self.settings.call_timeout,
                move |client| client.add_mapping(&request),
            )
            .await;

            match result {
                Ok(granted) => {
                    let granted = self.confirm_lease(gateway, granted).await;
                    state.registry.rekey(id, port)?;
                    if let Some(mapping) = state.registry.get_mut(id) {
                        mapping.mark_granted(&granted, gateway.generation, now);
                    }
                    info!(
                        "Mapped {} -> {} (granted lease {:?})",
                        key, granted.internal, granted.lease
                    );
                    return Ok(());
                }
                Err(MappingError::PortConflict { .. }) => {
                    debug!("{} is held by another host, trying the next port", key);
                    port = next_port(port);
                }
                Err(e) => {
                    warn!("Mapping {} failed: {}", key, e);
                    if let Some(mapping) = state.registry.get_mut(id) {
                        mapping.last_error = Some(e.to_string());
                    }
                    return Err(e);
                }
            }
        }

        let err = MappingError::MappingUnavailable {
            protocol: spec.protocol,
            internal_port: spec.internal_port,
            attempts,
        };
        warn!("{}", err);
        if let Some(mapping) = state.registry.get_mut(id) {
            mapping.mark_requested();
            mapping.state = MappingState::Unavailable;
            mapping.last_error = Some(err.to_string());
        }
        self.fallback.engage(&FallbackReason::MappingUnavailable {
            protocol: spec.protocol,
            internal_port: spec.internal_port,
        });
        Err(err)
    }

    /// Read the lease the gateway actually keeps for a fresh grant
    ///
    /// Runs as its own bounded call after the add; on any failure the
    /// accepted lease stands.
    async fn confirm_lease(
        &self,
        gateway: &GatewayHandle,
        granted: GrantedMapping,
    ) -> GrantedMapping {
        let key = MappingKey::new(granted.protocol, granted.external_port);
        let host = *granted.internal.ip();

        let listed = match call_with_timeout(
            gateway.client.clone(),
            self.settings.call_timeout,
            move |client| client.listed_lease(key, host),
        )
        .await
        {
            Ok(listed) => listed,
            Err(e) => {
                debug!(
                    "Could not read back the lease for {} ({}); keeping {:?}",
                    key, e, granted.lease
                );
                None
            }
        };

        let lease = effective_lease(granted.lease, listed);
        if lease != granted.lease {
            debug!(
                "Gateway keeps {} for {:?} (accepted {:?})",
                key, lease, granted.lease
            );
        }
        GrantedMapping { lease, ..granted }
    }

    /// The external port hint of mapping `id` changed: drop its current
    /// gateway entry and point it at the new preferred port
    async fn move_to_preferred_port(
        &self,
        state: &mut LeaseState,
        id: Uuid,
    ) -> Result<(), MappingError> {
        let Some(mapping) = state.registry.get(id) else {
            return Err(MappingError::Internal(format!("unknown mapping {}", id)));
        };
        let old_key = mapping.key();
        let spec = mapping.spec.clone();

        if mapping.granted_lease.is_some() {
            if let Some(gateway) = state.gateway.clone() {
                if let Err(e) = call_with_timeout(
                    gateway.client,
                    self.settings.call_timeout,
                    move |client| client.delete_mapping(old_key.protocol, old_key.external_port),
                )
                .await
                {
                    warn!(
                        "Failed to delete {} before moving it ({}); it will expire",
                        old_key, e
                    );
                }
            }
        }

        let preferred = spec.preferred_external_port();
        let port = first_free_port(&state.registry, spec.protocol, preferred, id);
        if let Some(mapping) = state.registry.get_mut(id) {
            mapping.mark_requested();
        }
        state.registry.rekey(id, port)?;
        info!("Moving {} to {}", old_key, MappingKey::new(spec.protocol, port));
        Ok(())
    }

    /// Returns `false` if the gateway delete failed or could not be attempted
    async fn release_id(&self, state: &mut LeaseState, id: Uuid) -> bool {
        let Some(mapping) = state.registry.get(id) else {
            return true;
        };
        let key = mapping.key();
        let mut deleted = true;

        if mapping.granted_lease.is_some() {
            match state.gateway.clone() {
                Some(gateway) => {
                    match call_with_timeout(gateway.client, self.settings.call_timeout, move |client| {
                        client.delete_mapping(key.protocol, key.external_port)
                    })
                    .await
                    {
                        Ok(()) => info!("Released {}", key),
                        Err(e) => {
                            warn!(
                                "Failed to delete {} on the gateway ({}); the lease will expire on its own",
                                key, e
                            );
                            deleted = false;
                        }
                    }
                }
                None => {
                    warn!("No gateway to release {} on; the lease will expire on its own", key);
                    deleted = false;
                }
            }
        }

        state.registry.remove(key);
        deleted
    }

    /// Delete leftovers of earlier runs from the gateway table
    async fn purge_stale(&self, state: &mut LeaseState) -> usize {
        let Some(gateway) = state.gateway.clone() else {
            return 0;
        };

        let table = match call_with_timeout(
            gateway.client.clone(),
            self.settings.discovery_timeout,
            |client| read_mapping_table(client, TABLE_SCAN_LIMIT),
        )
        .await
        {
            Ok(table) => table,
            Err(e) => {
                debug!("Could not read gateway mapping table: {}", e);
                return 0;
            }
        };

        let mut hosts: HashSet<Ipv4Addr> = state
            .registry
            .live()
            .map(|m| m.spec.internal_host)
            .collect();
        hosts.extend(self.settings.internal_host);
        if hosts.is_empty() {
            if let Ok(local) = local_ipv4_towards(gateway.descriptor().addr) {
                hosts.insert(local);
            }
        }

        let tracked: HashSet<MappingKey> = state
            .registry
            .live()
            .filter(|m| m.state.is_granted())
            .map(|m| m.key())
            .collect();

        let stale = select_stale(
            &table,
            &self.settings.description_tag,
            Utc::now().date_naive(),
            &hosts,
            &tracked,
        );

        let mut purged = 0;
        for key in stale {
            match call_with_timeout(
                gateway.client.clone(),
                self.settings.call_timeout,
                move |client| client.delete_mapping(key.protocol, key.external_port),
            )
            .await
            {
                Ok(()) => {
                    info!("Removed stale mapping {}", key);
                    purged += 1;
                }
                Err(e) => warn!("Failed to remove stale mapping {}: {}", key, e),
            }
        }
        purged
    }
}

fn next_port(port: u16) -> u16 {
    if port == u16::MAX {
        LOWEST_ALTERNATE_PORT
    } else {
        port + 1
    }
}

fn first_free_port(registry: &MappingRegistry, protocol: Protocol, start: u16, id: Uuid) -> u16 {
    let mut port = start;
    for _ in 0..u16::MAX {
        if !registry.is_claimed_by_other(MappingKey::new(protocol, port), id) {
            return port;
        }
        port = next_port(port);
    }
    start
}

/// Description sent to the gateway: `"<tag> <YYYY-MM-DD> <description>"`
pub(crate) fn stamp_description(tag: &str, today: NaiveDate, description: &str) -> String {
    let stamp = today.format(STAMP_FORMAT);
    if description.is_empty() {
        format!("{} {}", tag, stamp)
    } else {
        format!("{} {} {}", tag, stamp, description)
    }
}

/// Date stamp of a description carrying `tag`
pub(crate) fn parse_stamp(description: &str, tag: &str) -> Option<NaiveDate> {
    let rest = description.strip_prefix(tag)?.strip_prefix(' ')?;
    NaiveDate::parse_from_str(rest.get(..10)?, STAMP_FORMAT).ok()
}

/// Gateway entries left behind by earlier runs.
///
/// An entry qualifies when it carries our tag and either was stamped before
/// `today` or forwards to one of `hosts` without being tracked.
pub(crate) fn select_stale(
    entries: &[MappingEntry],
    tag: &str,
    today: NaiveDate,
    hosts: &HashSet<Ipv4Addr>,
    tracked: &HashSet<MappingKey>,
) -> Vec<MappingKey> {
    entries
        .iter()
        .filter_map(|entry| {
            let stamp = parse_stamp(&entry.description, tag)?;
            let ours = entry
                .internal_host()
                .is_some_and(|host| hosts.contains(&host));
            let key = entry.key();
            if ours && tracked.contains(&key) {
                return None;
            }
            (stamp < today || ours).then_some(key)
        })
        .collect()
}
