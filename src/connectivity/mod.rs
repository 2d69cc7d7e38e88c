//! Connectivity module for NAT traversal through UPnP IGD
//!
//! This module keeps external ports forwarded to this host:
//! - Gateway discovery and control (UPnP Internet Gateway Device)
//! - Lease bookkeeping with conflict-aware external port selection
//! - Background renewal and re-discovery
//! - CGNAT / double-NAT detection and a fallback signal
//!
//! Most applications only need [`NatTraversal`]; [`LeaseManager`] is the
//! lower-level handle for declaring and releasing mappings at runtime.

// Submodules
pub mod cgnat;
pub mod fallback;
pub mod gateway;
pub mod manager;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod upnp;

// Re-export commonly used types
pub use types::{
    GatewayDescriptor, GrantedMapping, MappingEntry, MappingError, MappingKey, MappingRequest,
    MappingSpec, MappingState, MappingStatus, PortMapping, Protocol,
};

// Re-export main functions
pub use cgnat::{classify_external_ip, detect_cgnat, is_private_ip, ExternalAddressKind};
pub use fallback::{FallbackChannel, FallbackReason, LogFallback, Reachability};
pub use gateway::{
    local_ipv4_for_gateway, local_ipv4_towards, GatewayClient, GatewayHandle, GatewayLocator,
};
pub use registry::MappingRegistry;
pub use upnp::{IgdClient, IgdLocator};

// Re-export managers
pub use manager::{LeaseManager, LeaseSettings, ReconcileReport, ShutdownReport};
pub use orchestrator::NatTraversal;
pub use scheduler::{RenewalScheduler, SchedulerConfig, SchedulerState, TickOutcome, UnreachableTracker};
