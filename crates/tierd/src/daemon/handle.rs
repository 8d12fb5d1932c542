//! Client interface for a running [`super::DaemonActor`].
//!
//! Health checks and request forwarding talk to the container runtime and
//! the container directly from the caller's task; only the ledger lookups
//! go through the actor.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `OrchestratorError::ChannelClosed`.

use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use tier_core::{Container, ContainerId, DaemonSnapshot, HealthStatus, KillReport, ProcessId};
use tier_runtime::ContainerRuntime;

use super::commands::DaemonCommand;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Cheap-to-clone handle to one platform daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    process_id: ProcessId,
    sender: mpsc::Sender<DaemonCommand>,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    forward_host: Arc<str>,
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("process_id", &self.process_id)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl DaemonHandle {
    pub fn new(
        process_id: ProcessId,
        sender: mpsc::Sender<DaemonCommand>,
        runtime: Arc<dyn ContainerRuntime>,
        http: reqwest::Client,
        forward_host: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            process_id,
            sender,
            runtime,
            http,
            forward_host: forward_host.into(),
        }
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    /// Returns `true` while the actor still accepts commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DaemonCommand,
    ) -> OrchestratorResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)
    }

    /// Builds and runs a container, returning its published port.
    ///
    /// # Errors
    /// - `DuplicateContainer` if the id is already in the stack
    /// - `CapacityExceeded` if the stack cannot hold it
    /// - `NoPortsAvailable` if every daemon port is taken
    /// - `ContainerStartFailed` if the runtime failed (state is rolled back)
    pub async fn initialize_container(&self, container: Container) -> OrchestratorResult<u16> {
        self.call(|respond_to| DaemonCommand::InitializeContainer {
            container,
            respond_to,
        })
        .await?
    }

    /// Asks the runtime for the container's health-check status.
    ///
    /// # Errors
    /// - `ContainerNotRunning` if the container is not running in this
    ///   daemon's stack, or the runtime has no live process for it
    pub async fn check_health(&self, container_id: ContainerId) -> OrchestratorResult<HealthStatus> {
        let owned = self
            .call(|respond_to| DaemonCommand::LookupPort {
                container_id,
                respond_to,
            })
            .await?;
        if let Err(e) = owned {
            debug!(process_id = %self.process_id, container_id = %container_id, error = %e, "Health check for container not running here");
            return Err(OrchestratorError::ContainerNotRunning { container_id });
        }

        let tag = container_id.tag(&self.process_id);
        let runtime_id = match self.runtime.find_running_id(&tag).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(OrchestratorError::ContainerNotRunning { container_id }),
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Runtime lookup failed");
                return Err(OrchestratorError::ContainerNotRunning { container_id });
            }
        };

        self.runtime.inspect_health(&runtime_id).await.map_err(|e| {
            debug!(container_id = %container_id, error = %e, "Health inspection failed");
            OrchestratorError::ContainerNotRunning { container_id }
        })
    }

    /// Relays `body` to the container's endpoint and returns the raw response.
    ///
    /// # Errors
    /// - `PortNotFound` if the container holds no port
    /// - `ContainerNotRunning` if it is still starting
    /// - `ForwardFailed` on transport errors
    pub async fn forward(&self, container_id: ContainerId, body: String) -> OrchestratorResult<String> {
        let port = self
            .call(|respond_to| DaemonCommand::LookupPort {
                container_id,
                respond_to,
            })
            .await??;

        let url = format!("http://{}:{}/", self.forward_host, port);
        debug!(process_id = %self.process_id, container_id = %container_id, url = %url, "Forwarding request");

        let failed = |e: reqwest::Error| OrchestratorError::ForwardFailed {
            container_id,
            reason: e.to_string(),
        };
        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(failed)?;
        response.text().await.map_err(failed)
    }

    /// Tears down the given containers concurrently.
    ///
    /// Ids not in the stack are reported as skipped; failures are collected
    /// in the report rather than returned as an error.
    pub async fn kill_containers(&self, container_ids: Vec<ContainerId>) -> OrchestratorResult<KillReport> {
        self.call(|respond_to| DaemonCommand::KillContainers {
            container_ids,
            respond_to,
        })
        .await
    }

    /// Applies new limits, returning the containers evicted to fit them.
    pub async fn set_resource_limits(&self, cpu: f64, memory: f64) -> OrchestratorResult<Vec<ContainerId>> {
        self.call(|respond_to| DaemonCommand::SetResourceLimits {
            cpu,
            memory,
            respond_to,
        })
        .await
    }

    pub async fn enable_overload(&self) -> OrchestratorResult<()> {
        self.call(|respond_to| DaemonCommand::EnableOverload { respond_to })
            .await?
    }

    pub async fn snapshot(&self) -> OrchestratorResult<DaemonSnapshot> {
        self.call(|respond_to| DaemonCommand::Snapshot { respond_to })
            .await
    }

    /// Shuts the daemon down and waits for its exit code.
    pub async fn shutdown(&self) -> OrchestratorResult<i32> {
        self.call(|respond_to| DaemonCommand::Shutdown {
            respond_to: Some(respond_to),
        })
        .await
    }

    /// Requests shutdown without waiting. The exit arrives as a lifecycle event.
    pub async fn request_shutdown(&self) -> OrchestratorResult<()> {
        self.sender
            .send(DaemonCommand::Shutdown { respond_to: None })
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tier_runtime::MockRuntime;

    fn create_test_handle() -> (DaemonHandle, mpsc::Receiver<DaemonCommand>, Arc<MockRuntime>) {
        let (tx, rx) = mpsc::channel(8);
        let runtime = Arc::new(MockRuntime::new());
        let handle = DaemonHandle::new(
            ProcessId::new("user0"),
            tx,
            runtime.clone(),
            reqwest::Client::new(),
            "127.0.0.1",
        );
        (handle, rx, runtime)
    }

    #[tokio::test]
    async fn test_initialize_sends_command() {
        let (handle, mut rx, _) = create_test_handle();

        let responder = tokio::spawn(async move {
            if let Some(DaemonCommand::InitializeContainer {
                container,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(container.id, ContainerId::new(7));
                let _ = respond_to.send(Ok(5007));
                return true;
            }
            false
        });

        let port = handle
            .initialize_container(Container::new(7u64, 0.5, 128.0, "models/echo"))
            .await
            .unwrap();
        assert_eq!(port, 5007);
        assert!(responder.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_actor_maps_to_channel_closed() {
        let (handle, rx, _) = create_test_handle();
        drop(rx);
        assert!(!handle.is_connected());
        assert_eq!(
            handle.snapshot().await.unwrap_err(),
            OrchestratorError::ChannelClosed
        );
        assert_eq!(
            handle.request_shutdown().await.unwrap_err(),
            OrchestratorError::ChannelClosed
        );
    }

    /// Answers every port lookup with `reply` until the handle is dropped.
    fn answer_lookups(mut rx: mpsc::Receiver<DaemonCommand>, reply: OrchestratorResult<u16>) {
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let DaemonCommand::LookupPort { respond_to, .. } = cmd {
                    let _ = respond_to.send(reply.clone());
                }
            }
        });
    }

    #[tokio::test]
    async fn test_health_of_unknown_container() {
        let (handle, rx, _) = create_test_handle();
        answer_lookups(
            rx,
            Err(OrchestratorError::PortNotFound {
                container_id: ContainerId::new(99),
            }),
        );
        assert_eq!(
            handle.check_health(ContainerId::new(99)).await,
            Err(OrchestratorError::ContainerNotRunning {
                container_id: ContainerId::new(99)
            })
        );
    }

    #[tokio::test]
    async fn test_health_reads_runtime_status() {
        let (handle, rx, runtime) = create_test_handle();
        answer_lookups(rx, Ok(5003));
        let tag = ContainerId::new(3).tag(&ProcessId::new("user0"));
        runtime.build("models/echo", &tag).await.unwrap();
        runtime.run(&tag, 5003, 0.5, 64.0).await.unwrap();
        runtime.set_health(&tag, HealthStatus::Starting);
        assert_eq!(
            handle.check_health(ContainerId::new(3)).await.unwrap(),
            HealthStatus::Starting
        );
    }

    #[tokio::test]
    async fn test_health_ignores_containers_outside_stack() {
        let (handle, rx, runtime) = create_test_handle();
        answer_lookups(
            rx,
            Err(OrchestratorError::PortNotFound {
                container_id: ContainerId::new(3),
            }),
        );

        // Running in the runtime under this owner's tag, but not in the stack
        let tag = ContainerId::new(3).tag(&ProcessId::new("user0"));
        runtime.build("models/echo", &tag).await.unwrap();
        runtime.run(&tag, 5003, 0.5, 64.0).await.unwrap();
        assert_eq!(
            handle.check_health(ContainerId::new(3)).await,
            Err(OrchestratorError::ContainerNotRunning {
                container_id: ContainerId::new(3)
            })
        );
    }

    #[tokio::test]
    async fn test_health_uses_owner_scoped_tag() {
        let (handle, rx, runtime) = create_test_handle();
        answer_lookups(rx, Ok(5003));

        // Another process's container 3 is invisible to user0
        let tag = ContainerId::new(3).tag(&ProcessId::new("user1"));
        runtime.build("models/echo", &tag).await.unwrap();
        runtime.run(&tag, 5003, 0.5, 64.0).await.unwrap();
        assert_eq!(
            handle.check_health(ContainerId::new(3)).await,
            Err(OrchestratorError::ContainerNotRunning {
                container_id: ContainerId::new(3)
            })
        );
    }
}
