//! Domain-specific error types following panic-free policy.

use crate::ContainerId;
use thiserror::Error;

/// Errors raised by the per-daemon ledgers (capacity stack and port table).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Pushing the container would take the stack over its CPU or memory ceiling.
    #[error(
        "capacity exceeded by container {container_id}: cpu {requested_cpu:.3}/{capacity_cpu:.3}, memory {requested_memory:.1}/{capacity_memory:.1}"
    )]
    CapacityExceeded {
        container_id: ContainerId,
        requested_cpu: f64,
        capacity_cpu: f64,
        requested_memory: f64,
        capacity_memory: f64,
    },

    /// CPU or memory request is negative or not a finite number.
    #[error("container {container_id} has an invalid request: cpu {cpu}, memory {memory}")]
    InvalidRequest {
        container_id: ContainerId,
        cpu: f64,
        memory: f64,
    },

    /// Every port in the table is assigned.
    #[error("no free ports available ({total} assigned)")]
    NoPortsAvailable { total: usize },

    /// The container already holds a port.
    #[error("container {container_id} already has an allocated port")]
    AlreadyAllocated { container_id: ContainerId },

    /// The container holds no port.
    #[error("container {container_id} not found in port mapping")]
    PortNotFound { container_id: ContainerId },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::NoPortsAvailable { total: 4 };
        assert_eq!(err.to_string(), "no free ports available (4 assigned)");

        let err = DomainError::PortNotFound {
            container_id: ContainerId::new(17),
        };
        assert_eq!(err.to_string(), "container 17 not found in port mapping");

        let err = DomainError::AlreadyAllocated {
            container_id: ContainerId::new(3),
        };
        assert!(err.to_string().contains("already has an allocated port"));
    }

    #[test]
    fn test_capacity_error_mentions_limits() {
        let err = DomainError::CapacityExceeded {
            container_id: ContainerId::new(9),
            requested_cpu: 1.5,
            capacity_cpu: 1.0,
            requested_memory: 512.0,
            capacity_memory: 1024.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("container 9"));
        assert!(msg.contains("1.500/1.000"));
    }

    #[test]
    fn test_invalid_request_display() {
        let err = DomainError::InvalidRequest {
            container_id: ContainerId::new(4),
            cpu: -1.0,
            memory: 64.0,
        };
        assert_eq!(
            err.to_string(),
            "container 4 has an invalid request: cpu -1, memory 64"
        );
    }
}
