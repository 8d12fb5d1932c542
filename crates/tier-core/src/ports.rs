//! Hashed per-daemon port allocation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{ContainerId, DomainError, DomainResult};

/// Open-addressing port table over a fixed, ordered set of host ports.
///
/// A container's home slot is `container_id mod |ports|`; collisions probe
/// forward one slot at a time, wrapping at the end. A port is either in
/// `available` or assigned to exactly one container, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortTable {
    ports: Vec<u16>,
    available: BTreeSet<u16>,
    assigned: BTreeMap<ContainerId, u16>,
}

impl PortTable {
    /// Creates a table over `ports`. Duplicates are dropped, order is kept.
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut seen = BTreeSet::new();
        let ports: Vec<u16> = ports.into_iter().filter(|p| seen.insert(*p)).collect();
        Self {
            available: ports.iter().copied().collect(),
            ports,
            assigned: BTreeMap::new(),
        }
    }

    /// Assigns a port to `container_id`.
    ///
    /// # Errors
    /// - `DomainError::AlreadyAllocated` if the container already holds a port
    /// - `DomainError::NoPortsAvailable` if every port is assigned
    pub fn allocate(&mut self, container_id: ContainerId) -> DomainResult<u16> {
        if self.assigned.contains_key(&container_id) {
            return Err(DomainError::AlreadyAllocated { container_id });
        }
        if self.available.is_empty() {
            return Err(DomainError::NoPortsAvailable {
                total: self.ports.len(),
            });
        }

        let len = self.ports.len();
        // len > 0 here: available is non-empty and only ever holds table ports
        let home = (container_id.get() % len as u64) as usize;

        for offset in 0..len {
            let slot = (home + offset) % len;
            let Some(&port) = self.ports.get(slot) else {
                continue;
            };
            if self.available.remove(&port) {
                self.assigned.insert(container_id, port);
                return Ok(port);
            }
        }

        Err(DomainError::NoPortsAvailable { total: len })
    }

    /// Returns the port held by `container_id`.
    ///
    /// # Errors
    /// - `DomainError::PortNotFound` if the container holds no port
    pub fn lookup(&self, container_id: ContainerId) -> DomainResult<u16> {
        self.assigned
            .get(&container_id)
            .copied()
            .ok_or(DomainError::PortNotFound { container_id })
    }

    /// Returns the container's port to the pool.
    ///
    /// # Errors
    /// - `DomainError::PortNotFound` if the container holds no port
    pub fn release(&mut self, container_id: ContainerId) -> DomainResult<u16> {
        let port = self
            .assigned
            .remove(&container_id)
            .ok_or(DomainError::PortNotFound { container_id })?;
        self.available.insert(port);
        Ok(port)
    }

    pub fn is_saturated(&self) -> bool {
        self.available.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ports.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    /// Current assignments, ordered by container id.
    pub fn assignments(&self) -> impl Iterator<Item = (ContainerId, u16)> + '_ {
        self.assigned.iter().map(|(id, port)| (*id, *port))
    }
}
