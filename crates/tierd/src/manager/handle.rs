//! Client interface for the [`super::ManagerActor`].
//!
//! This is the control surface: the socket server and the tests drive the
//! orchestrator exclusively through a [`ManagerHandle`].
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `OrchestratorError::ChannelClosed`.

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use tier_core::{
    Container, ContainerId, HealthStatus, KillReport, Message, MessageId, MessageIntent,
    MessageLookup, ProcessId, SystemSnapshot, TierLevel,
};

use super::commands::ManagerCommand;
use crate::daemon::DaemonHandle;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Cheap-to-clone handle to the daemon manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    sender: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    pub fn new(sender: mpsc::Sender<ManagerCommand>) -> Self {
        Self { sender }
    }

    /// Returns `true` while the manager still accepts commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> OrchestratorResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)
    }

    // ========================================================================
    // Message Queue
    // ========================================================================

    /// Queues an allocation request and returns its id.
    ///
    /// When `tier` is `None` it is looked up from the Tier Directory.
    pub async fn enqueue(
        &self,
        intent: MessageIntent,
        tier: Option<TierLevel>,
        priority: u32,
    ) -> OrchestratorResult<MessageId> {
        self.call(|respond_to| ManagerCommand::Enqueue {
            intent,
            tier,
            priority,
            respond_to,
        })
        .await?
    }

    pub async fn message_status(&self, id: MessageId) -> OrchestratorResult<MessageLookup> {
        self.call(|respond_to| ManagerCommand::MessageStatus { id, respond_to })
            .await
    }

    /// Processes the head of the queue once, returning it as it now stands.
    pub async fn tick(&self) -> OrchestratorResult<Option<Message>> {
        self.call(|respond_to| ManagerCommand::Tick {
            respond_to: Some(respond_to),
        })
        .await
    }

    // ========================================================================
    // Daemons and Containers
    // ========================================================================

    /// Handle of the daemon serving `process_id`.
    ///
    /// # Errors
    /// - `DaemonNotFound` if no daemon is registered
    pub async fn daemon(&self, process_id: &ProcessId) -> OrchestratorResult<DaemonHandle> {
        let process_id = process_id.clone();
        self.call(|respond_to| ManagerCommand::GetDaemon {
            process_id,
            respond_to,
        })
        .await?
    }

    /// Starts a container in the process's daemon, returning its port.
    pub async fn initialize_container(
        &self,
        process_id: &ProcessId,
        container: Container,
    ) -> OrchestratorResult<u16> {
        self.daemon(process_id)
            .await?
            .initialize_container(container)
            .await
    }

    pub async fn check_health(
        &self,
        process_id: &ProcessId,
        container_id: ContainerId,
    ) -> OrchestratorResult<HealthStatus> {
        self.daemon(process_id)
            .await?
            .check_health(container_id)
            .await
    }

    /// Relays an opaque body to a container and returns the raw response.
    pub async fn forward(
        &self,
        process_id: &ProcessId,
        container_id: ContainerId,
        body: String,
    ) -> OrchestratorResult<String> {
        self.daemon(process_id)
            .await?
            .forward(container_id, body)
            .await
    }

    /// Shuts down a process's daemon.
    ///
    /// Returns once shutdown is requested; the daemon is unregistered and its
    /// resources released when it reports its exit.
    pub async fn kill_process(&self, process_id: &ProcessId) -> OrchestratorResult<()> {
        let process_id = process_id.clone();
        self.call(|respond_to| ManagerCommand::KillProcess {
            process_id,
            respond_to,
        })
        .await?
    }

    /// Tears down a single container. Unknown containers are a no-op.
    ///
    /// # Errors
    /// - `KillFailed` if the runtime could not stop or remove it
    pub async fn kill_container(
        &self,
        process_id: &ProcessId,
        container_id: ContainerId,
    ) -> OrchestratorResult<KillReport> {
        let report = self
            .daemon(process_id)
            .await?
            .kill_containers(vec![container_id])
            .await?;
        if report.is_clean() {
            Ok(report)
        } else {
            Err(OrchestratorError::KillFailed(report))
        }
    }

    // ========================================================================
    // Whole System
    // ========================================================================

    /// Daemons, live queue and ledger at one point in time.
    ///
    /// Daemons that exit while the snapshot is assembled are left out.
    pub async fn snapshot(&self) -> OrchestratorResult<SystemSnapshot> {
        let view = self
            .call(|respond_to| ManagerCommand::Snapshot { respond_to })
            .await?;

        let mut daemons = Vec::with_capacity(view.daemons.len());
        for (daemon, snapshot) in view
            .daemons
            .iter()
            .zip(join_all(view.daemons.iter().map(|d| d.snapshot())).await)
        {
            match snapshot {
                Ok(snapshot) => daemons.push(snapshot),
                Err(e) => debug!(process_id = %daemon.process_id(), error = %e, "Daemon left during snapshot"),
            }
        }
        daemons.sort_by(|a, b| a.process_id.cmp(&b.process_id));

        Ok(SystemSnapshot {
            daemons,
            queue: view.queue,
            monitor: view.monitor,
        })
    }

    /// Shuts every daemon down and stops the manager.
    ///
    /// Returns each daemon's exit code.
    pub async fn shutdown(&self) -> OrchestratorResult<Vec<(ProcessId, i32)>> {
        self.call(|respond_to| ManagerCommand::Shutdown { respond_to })
            .await
    }
}
