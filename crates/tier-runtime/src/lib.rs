//! Container runtime integration for tierd.
//!
//! The orchestrator never shells out directly; every build/run/stop goes
//! through the [`ContainerRuntime`] trait so daemons can be driven by the
//! docker CLI in production and by [`MockRuntime`] in tests.
//!
//! Containers are addressed by *tag* (the container id scoped to its owning
//! process, see `ContainerId::tag`) when building and running, and by the
//! runtime's own id once running.

mod docker;
mod error;
mod mock;

pub use docker::{DockerRuntime, CONTAINER_LISTEN_PORT};
pub use error::RuntimeError;
pub use mock::{MockRuntime, RuntimeCall};

use async_trait::async_trait;
use tier_core::HealthStatus;

/// Operations the orchestrator needs from a container engine.
///
/// Every method resolves to success or a [`RuntimeError`]; callers map a
/// failure onto their own error taxonomy.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Builds the image at `context` and tags it `tag`.
    async fn build(&self, context: &str, tag: &str) -> Result<(), RuntimeError>;

    /// Runs a detached container from image `tag`, publishing `host_port`
    /// and capping it at `cpu` cores and `memory_mb` megabytes.
    async fn run(&self, tag: &str, host_port: u16, cpu: f64, memory_mb: f64)
        -> Result<(), RuntimeError>;

    /// Looks up the runtime id of the running container for `tag`.
    ///
    /// Returns `Ok(None)` if nothing is running for the tag.
    async fn find_running_id(&self, tag: &str) -> Result<Option<String>, RuntimeError>;

    /// Reads the health-check status of a running container.
    async fn inspect_health(&self, runtime_id: &str) -> Result<HealthStatus, RuntimeError>;

    /// Stops a running container.
    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError>;

    /// Removes a stopped container.
    async fn remove_container(&self, runtime_id: &str) -> Result<(), RuntimeError>;

    /// Removes the image built for `tag`.
    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError>;
}
