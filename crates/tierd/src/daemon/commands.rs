//! Daemon actor commands and lifecycle events.

use tokio::sync::oneshot;

use tier_core::{Container, ContainerId, DaemonSnapshot, KillReport, ProcessId};
use tier_runtime::RuntimeError;

use crate::error::OrchestratorResult;

// ============================================================================
// Daemon Commands
// ============================================================================

/// Commands processed sequentially by a [`super::DaemonActor`].
#[derive(Debug)]
pub enum DaemonCommand {
    /// Reserve capacity and a port, then build and run the container.
    ///
    /// Answered once the runtime finishes, with the published port.
    InitializeContainer {
        container: Container,
        respond_to: oneshot::Sender<OrchestratorResult<u16>>,
    },

    /// Sent by the starter task when build/run completes.
    ContainerStarted {
        container_id: ContainerId,
        outcome: StartOutcome,
    },

    /// Port of a running container.
    LookupPort {
        container_id: ContainerId,
        respond_to: oneshot::Sender<OrchestratorResult<u16>>,
    },

    /// Tear down a batch of containers concurrently.
    KillContainers {
        container_ids: Vec<ContainerId>,
        respond_to: oneshot::Sender<KillReport>,
    },

    /// Replace the capacity, evicting newest containers until usage fits.
    SetResourceLimits {
        cpu: f64,
        memory: f64,
        respond_to: oneshot::Sender<Vec<ContainerId>>,
    },

    /// Start the overload window.
    EnableOverload {
        respond_to: oneshot::Sender<OrchestratorResult<()>>,
    },

    Snapshot {
        respond_to: oneshot::Sender<DaemonSnapshot>,
    },

    /// Kill every container and exit. Answered with the exit code.
    Shutdown {
        respond_to: Option<oneshot::Sender<i32>>,
    },
}

/// How a container start ended.
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    Failed(RuntimeError),
    /// Killed or evicted while starting; the starter already tore it down.
    Cancelled,
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Notifications a daemon sends to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The daemon stopped; `code` is 0 when every container was torn down.
    Exited { process_id: ProcessId, code: i32 },

    /// The overload window elapsed. Sent once per window.
    OverloadExited { process_id: ProcessId },
}

impl LifecycleEvent {
    pub fn process_id(&self) -> &ProcessId {
        match self {
            Self::Exited { process_id, .. } | Self::OverloadExited { process_id } => process_id,
        }
    }
}
