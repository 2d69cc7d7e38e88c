//! In-memory record of mappings, indexed by `(protocol, external port)`
//!
//! Pure bookkeeping; nothing here talks to the network. The registry keeps
//! `Removed` mappings around for status reporting but drops them from the key
//! index, so at most one live mapping claims any external port per protocol.

use super::types::{MappingError, MappingKey, MappingState, PortMapping, Protocol};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Mapping store owned by the lease manager
#[derive(Debug, Default)]
pub struct MappingRegistry {
    mappings: HashMap<Uuid, PortMapping>,
    index: HashMap<MappingKey, Uuid>,
    order: Vec<Uuid>,
}

impl MappingRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live mapping under its current key
    ///
    /// Fails with `PortConflict` if another live mapping claims the key.
    pub fn insert(&mut self, mapping: PortMapping) -> Result<Uuid, MappingError> {
        let key = mapping.key();
        if self.index.contains_key(&key) {
            return Err(MappingError::PortConflict {
                protocol: key.protocol,
                external_port: key.external_port,
            });
        }

        // A re-declared spec replaces its removed predecessor in status reports
        let spec = &mapping.spec;
        let superseded: Vec<Uuid> = self
            .mappings
            .values()
            .filter(|m| {
                m.state == MappingState::Removed
                    && m.spec.protocol == spec.protocol
                    && m.spec.internal_host == spec.internal_host
                    && m.spec.internal_port == spec.internal_port
            })
            .map(|m| m.id)
            .collect();
        for id in superseded {
            self.mappings.remove(&id);
            self.order.retain(|existing| *existing != id);
        }

        let id = mapping.id;
        self.index.insert(key, id);
        self.order.push(id);
        self.mappings.insert(id, mapping);
        Ok(id)
    }

    /// Mapping by id
    pub fn get(&self, id: Uuid) -> Option<&PortMapping> {
        self.mappings.get(&id)
    }

    /// Mutable mapping by id.
    ///
    /// Change the external port through [`MappingRegistry::rekey`] only.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut PortMapping> {
        self.mappings.get_mut(&id)
    }

    /// Live mapping claiming `key`
    pub fn lookup(&self, key: MappingKey) -> Option<&PortMapping> {
        self.index.get(&key).and_then(|id| self.mappings.get(id))
    }

    /// Id of the live mapping claiming `key`
    pub fn id_for(&self, key: MappingKey) -> Option<Uuid> {
        self.index.get(&key).copied()
    }

    /// Live mapping declared for this internal endpoint
    pub fn find_by_internal(
        &self,
        protocol: Protocol,
        internal_host: Ipv4Addr,
        internal_port: u16,
    ) -> Option<Uuid> {
        self.live()
            .find(|m| {
                m.spec.protocol == protocol
                    && m.spec.internal_host == internal_host
                    && m.spec.internal_port == internal_port
            })
            .map(|m| m.id)
    }

    /// `key` is claimed by a live mapping other than `id`
    pub fn is_claimed_by_other(&self, key: MappingKey, id: Uuid) -> bool {
        self.index.get(&key).is_some_and(|holder| *holder != id)
    }

    /// Move mapping `id` to a different external port
    pub fn rekey(&mut self, id: Uuid, external_port: u16) -> Result<(), MappingError> {
        let Some(mapping) = self.mappings.get_mut(&id) else {
            return Err(MappingError::Internal(format!("unknown mapping {}", id)));
        };
        let old_key = mapping.key();
        let new_key = MappingKey::new(old_key.protocol, external_port);
        if old_key == new_key {
            return Ok(());
        }
        if self.index.get(&new_key).is_some_and(|holder| *holder != id) {
            return Err(MappingError::PortConflict {
                protocol: new_key.protocol,
                external_port,
            });
        }

        mapping.external_port = external_port;
        if mapping.state.is_live() {
            self.index.remove(&old_key);
            self.index.insert(new_key, id);
        }
        Ok(())
    }

    /// Transition to `Removed` and release the key
    pub fn mark_removed(&mut self, id: Uuid) -> Option<&PortMapping> {
        let mapping = self.mappings.get_mut(&id)?;
        let key = mapping.key();
        mapping.state = MappingState::Removed;
        mapping.granted_at = None;
        if self.index.get(&key) == Some(&id) {
            self.index.remove(&key);
        }
        Some(mapping)
    }

    /// Transition the live mapping claiming `key` to `Removed`, freeing the key
    pub fn remove(&mut self, key: MappingKey) -> Option<&PortMapping> {
        let id = self.id_for(key)?;
        self.mark_removed(id)
    }

    /// Ids of live mappings in declaration order
    pub fn live_ids(&self) -> Vec<Uuid> {
        self.live().map(|m| m.id).collect()
    }

    /// Live mappings in declaration order
    pub fn live(&self) -> impl Iterator<Item = &PortMapping> {
        self.all().filter(|m| m.state.is_live())
    }

    /// Every mapping, `Removed` included, in declaration order
    pub fn all(&self) -> impl Iterator<Item = &PortMapping> {
        self.order.iter().filter_map(|id| self.mappings.get(id))
    }

    /// Number of live mappings
    pub fn live_count(&self) -> usize {
        self.index.len()
    }
}
