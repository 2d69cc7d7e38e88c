//! Portlease - UPnP port mapping with lease management
//!
//! This library makes a host behind a home NAT reachable from the internet.
//! It discovers the LAN's UPnP Internet Gateway Device, asks it to forward
//! external ports to this host, keeps those leases renewed in the background
//! and removes them again on shutdown. When no gateway cooperates it tells the
//! host application to fall back to relay or manual connectivity.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectivity;

/// Result type alias for Portlease operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Portlease operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Port mapping error
    #[error("Mapping error: {0}")]
    Mapping(#[from] connectivity::MappingError),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize the Portlease library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests;
