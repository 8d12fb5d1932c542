//! Orchestrator error taxonomy.
//!
//! One closed enum covers every failure the control surface can report.
//! Resource shortages are grouped under [`ResourceAllocationError`] so the
//! manager (and remote callers) can tell "retry later" apart from permanent
//! failures with a single match.

use thiserror::Error;

use tier_core::{ContainerId, DomainError, KillReport, ProcessId, TierLevel};
use tier_runtime::RuntimeError;

use crate::tiers::TierDirectoryError;

// ============================================================================
// Resource Allocation Errors
// ============================================================================

/// The global ledger cannot satisfy a request right now.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceAllocationError {
    /// Not enough tier budget for a spawn, even after preemption.
    #[error("cannot guarantee {required} blocks to {process_id} at tier {tier} (only {available} reclaimable)")]
    Guarantee {
        process_id: ProcessId,
        tier: TierLevel,
        required: u32,
        available: u32,
    },

    /// Not enough shared headroom for an overload grant, even after preemption.
    #[error("cannot grant {required} overload blocks to {process_id} at tier {tier} (only {available} reclaimable)")]
    Overload {
        process_id: ProcessId,
        tier: TierLevel,
        required: u32,
        available: u32,
    },

    /// The global port pool is too small.
    #[error("{process_id} needs {requested} ports but only {available} are free")]
    Ports {
        process_id: ProcessId,
        requested: u32,
        available: usize,
    },
}

// ============================================================================
// Orchestrator Errors
// ============================================================================

/// Every failure reported by the monitor, daemons and manager.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(DomainError),

    #[error("invalid container: {0}")]
    InvalidContainer(DomainError),

    #[error("no free ports in daemon ({total} in use)")]
    NoPortsAvailable { total: usize },

    #[error("container {container_id} has no port")]
    PortNotFound { container_id: ContainerId },

    #[error("container {container_id} already has a port")]
    AlreadyAllocated { container_id: ContainerId },

    #[error("container {container_id} already exists in daemon {process_id}")]
    DuplicateContainer {
        process_id: ProcessId,
        container_id: ContainerId,
    },

    #[error("container {container_id} failed to start: {reason}")]
    ContainerStartFailed {
        container_id: ContainerId,
        reason: String,
    },

    #[error("container {container_id} is not running")]
    ContainerNotRunning { container_id: ContainerId },

    #[error("forward to container {container_id} failed: {reason}")]
    ForwardFailed {
        container_id: ContainerId,
        reason: String,
    },

    #[error(transparent)]
    ResourceAllocation(#[from] ResourceAllocationError),

    #[error("daemon already registered for {0}")]
    AlreadyRegistered(ProcessId),

    #[error("no daemon registered for {0}")]
    DaemonNotFound(ProcessId),

    #[error("process {0} is not tracked by the resource monitor")]
    ProcessNotTracked(ProcessId),

    #[error(transparent)]
    TierDirectory(#[from] TierDirectoryError),

    /// Some containers in a kill batch could not be torn down.
    #[error("{} of {} container kills failed", .0.failed.len(), .0.failed.len() + .0.killed.len())]
    KillFailed(KillReport),

    #[error("daemon {0} is shutting down")]
    DaemonUnavailable(ProcessId),

    #[error("actor channel closed")]
    ChannelClosed,
}

impl OrchestratorError {
    /// Stable machine-readable error code for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::InvalidContainer(_) => "invalid_container",
            Self::NoPortsAvailable { .. } => "no_ports_available",
            Self::PortNotFound { .. } => "port_not_found",
            Self::AlreadyAllocated { .. } => "already_allocated",
            Self::DuplicateContainer { .. } => "duplicate_container",
            Self::ContainerStartFailed { .. } => "container_start_failed",
            Self::ContainerNotRunning { .. } => "container_not_running",
            Self::ForwardFailed { .. } => "forward_failed",
            Self::ResourceAllocation(ResourceAllocationError::Guarantee { .. }) => {
                "guarantee_resource_allocation"
            }
            Self::ResourceAllocation(ResourceAllocationError::Overload { .. }) => {
                "overload_resource_allocation"
            }
            Self::ResourceAllocation(ResourceAllocationError::Ports { .. }) => {
                "port_allocation"
            }
            Self::AlreadyRegistered(_) => "already_registered",
            Self::DaemonNotFound(_) => "daemon_not_found",
            Self::ProcessNotTracked(_) => "process_not_tracked",
            Self::TierDirectory(_) => "tier_directory",
            Self::KillFailed(_) => "kill_failed",
            Self::DaemonUnavailable(_) => "daemon_unavailable",
            Self::ChannelClosed => "channel_closed",
        }
    }

    /// True when the same request may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        self.is_resource_shortage()
    }

    /// Resource shortages keep a queued message waiting instead of failing it.
    pub fn is_resource_shortage(&self) -> bool {
        matches!(self, Self::ResourceAllocation(_))
    }
}

impl From<DomainError> for OrchestratorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::CapacityExceeded { .. } => Self::CapacityExceeded(err),
            DomainError::InvalidRequest { .. } => Self::InvalidContainer(err),
            DomainError::NoPortsAvailable { total } => Self::NoPortsAvailable { total },
            DomainError::AlreadyAllocated { container_id } => {
                Self::AlreadyAllocated { container_id }
            }
            DomainError::PortNotFound { container_id } => Self::PortNotFound { container_id },
        }
    }
}

impl OrchestratorError {
    pub fn start_failed(container_id: ContainerId, err: &RuntimeError) -> Self {
        Self::ContainerStartFailed {
            container_id,
            reason: err.to_string(),
        }
    }
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
