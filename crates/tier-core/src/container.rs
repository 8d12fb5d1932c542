//! Containers and the per-daemon capacity ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::{ContainerId, DomainError, DomainResult};

/// Slack allowed when comparing fractional CPU/memory sums.
const CAPACITY_EPSILON: f64 = 1e-9;

// ============================================================================
// Container
// ============================================================================

/// A model-serving container request.
///
/// `cpu` is a fraction of host cores, `memory` is in megabytes, and `model`
/// is the build context (path or URL) of the image to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub cpu: f64,
    pub memory: f64,
    pub model: String,
}

impl Container {
    pub fn new(id: impl Into<ContainerId>, cpu: f64, memory: f64, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cpu,
            memory,
            model: model.into(),
        }
    }

    /// True when both requests are finite and non-negative.
    pub fn is_valid_request(&self) -> bool {
        [self.cpu, self.memory]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {}, cpu: {}, memory: {}, model: {}}}",
            self.id, self.cpu, self.memory, self.model
        )
    }
}

// ============================================================================
// Stack Usage
// ============================================================================

/// Current/maximum pair returned by [`ContainerStack::usage`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StackUsage {
    pub used_cpu: f64,
    pub capacity_cpu: f64,
    pub used_memory: f64,
    pub capacity_memory: f64,
}

impl StackUsage {
    /// Returns true when usage fits inside capacity.
    pub fn fits(&self) -> bool {
        self.used_cpu <= self.capacity_cpu + CAPACITY_EPSILON
            && self.used_memory <= self.capacity_memory + CAPACITY_EPSILON
    }
}

// ============================================================================
// Container Stack
// ============================================================================

/// Capacity-bounded, insertion-ordered set of running containers.
///
/// Usage is always the sum of the members' cpu/memory; it is recomputed on
/// every mutation rather than tracked incrementally. A push that would exceed
/// capacity is rejected and leaves the stack untouched.
///
/// Capacity can be lowered below usage with [`ContainerStack::set_capacity`];
/// the owner is then responsible for evicting members (most recent first)
/// until [`StackUsage::fits`] holds again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStack {
    capacity_cpu: f64,
    capacity_memory: f64,
    used_cpu: f64,
    used_memory: f64,
    members: Vec<Container>,
}

impl ContainerStack {
    pub fn new(capacity_cpu: f64, capacity_memory: f64) -> Self {
        Self {
            capacity_cpu,
            capacity_memory,
            used_cpu: 0.0,
            used_memory: 0.0,
            members: Vec::new(),
        }
    }

    /// Pushes a container if the post-push usage stays within capacity.
    ///
    /// # Errors
    /// - `DomainError::InvalidRequest` if cpu or memory is negative or not finite
    /// - `DomainError::CapacityExceeded` if either ceiling would be crossed
    pub fn push(&mut self, container: Container) -> DomainResult<()> {
        if !container.is_valid_request() {
            return Err(DomainError::InvalidRequest {
                container_id: container.id,
                cpu: container.cpu,
                memory: container.memory,
            });
        }

        let requested_cpu = self.used_cpu + container.cpu;
        let requested_memory = self.used_memory + container.memory;

        if requested_cpu > self.capacity_cpu + CAPACITY_EPSILON
            || requested_memory > self.capacity_memory + CAPACITY_EPSILON
        {
            return Err(DomainError::CapacityExceeded {
                container_id: container.id,
                requested_cpu,
                capacity_cpu: self.capacity_cpu,
                requested_memory,
                capacity_memory: self.capacity_memory,
            });
        }

        self.members.push(container);
        self.recompute();
        Ok(())
    }

    /// Removes a container by id, returning it.
    ///
    /// Removing an absent id is a logged no-op.
    pub fn remove(&mut self, id: ContainerId) -> Option<Container> {
        let Some(index) = self.members.iter().position(|c| c.id == id) else {
            debug!(container_id = %id, "Container not in stack, nothing to remove");
            return None;
        };

        let removed = self.members.remove(index);
        self.recompute();
        Some(removed)
    }

    pub fn exists(&self, id: ContainerId) -> bool {
        self.members.iter().any(|c| c.id == id)
    }

    pub fn get(&self, id: ContainerId) -> Option<&Container> {
        self.members.iter().find(|c| c.id == id)
    }

    pub fn usage(&self) -> StackUsage {
        StackUsage {
            used_cpu: self.used_cpu,
            capacity_cpu: self.capacity_cpu,
            used_memory: self.used_memory,
            capacity_memory: self.capacity_memory,
        }
    }

    /// Replaces the capacity. Usage may exceed the new ceiling afterwards.
    pub fn set_capacity(&mut self, cpu: f64, memory: f64) {
        self.capacity_cpu = cpu;
        self.capacity_memory = memory;
    }

    /// Most recently pushed container.
    pub fn top(&self) -> Option<&Container> {
        self.members.last()
    }

    /// Members in push order.
    pub fn members(&self) -> &[Container] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn recompute(&mut self) {
        self.used_cpu = self.members.iter().map(|c| c.cpu).sum();
        self.used_memory = self.members.iter().map(|c| c.memory).sum();
    }
}
