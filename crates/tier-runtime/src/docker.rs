//! Docker CLI runtime.
//!
//! Every call spawns the `docker` binary through `tokio::process`, so the
//! daemon's task is suspended rather than blocked while docker works.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use tier_core::HealthStatus;

use crate::{ContainerRuntime, RuntimeError};

/// Port every model image listens on inside its container.
pub const CONTAINER_LISTEN_PORT: u16 = 5000;

/// Health template that tolerates images without a HEALTHCHECK.
const HEALTH_FORMAT: &str = "{{if .State.Health}}{{.State.Health.Status}}{{end}}";

/// [`ContainerRuntime`] backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    program: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    /// Uses a different CLI binary (e.g. `podman`).
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the CLI and returns trimmed stdout on success.
    async fn exec(
        &self,
        operation: &'static str,
        target: &str,
        args: &[String],
    ) -> Result<String, RuntimeError> {
        trace!(program = %self.program, ?args, "Invoking container runtime");

        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RuntimeError::command_failed(
                operation,
                target,
                output.status.code(),
                stderr,
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(operation, target, "Container runtime call succeeded");
        Ok(stdout)
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn build_args(context: &str, tag: &str) -> Vec<String> {
    vec![
        "build".to_string(),
        "-t".to_string(),
        tag.to_string(),
        context.to_string(),
    ]
}

fn run_args(tag: &str, host_port: u16, cpu: f64, memory_mb: f64) -> Vec<String> {
    vec![
        "run".to_string(),
        "-d".to_string(),
        format!("--memory={}m", memory_mb.floor() as u64),
        format!("--cpus={cpu}"),
        "-p".to_string(),
        format!("{host_port}:{CONTAINER_LISTEN_PORT}"),
        tag.to_string(),
    ]
}

fn ps_args(tag: &str) -> Vec<String> {
    vec![
        "ps".to_string(),
        "-q".to_string(),
        "--filter".to_string(),
        format!("ancestor={tag}"),
    ]
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build(&self, context: &str, tag: &str) -> Result<(), RuntimeError> {
        self.exec("build", tag, &build_args(context, tag)).await?;
        Ok(())
    }

    async fn run(
        &self,
        tag: &str,
        host_port: u16,
        cpu: f64,
        memory_mb: f64,
    ) -> Result<(), RuntimeError> {
        self.exec("run", tag, &run_args(tag, host_port, cpu, memory_mb))
            .await?;
        Ok(())
    }

    async fn find_running_id(&self, tag: &str) -> Result<Option<String>, RuntimeError> {
        let stdout = self.exec("ps", tag, &ps_args(tag)).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }

    async fn inspect_health(&self, runtime_id: &str) -> Result<HealthStatus, RuntimeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            HEALTH_FORMAT.to_string(),
            runtime_id.to_string(),
        ];
        let stdout = self.exec("inspect", runtime_id, &args).await?;
        Ok(HealthStatus::parse_runtime_output(&stdout))
    }

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        let args = vec!["kill".to_string(), runtime_id.to_string()];
        self.exec("stop", runtime_id, &args).await?;
        Ok(())
    }

    async fn remove_container(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        let args = vec![
            "container".to_string(),
            "rm".to_string(),
            runtime_id.to_string(),
        ];
        self.exec("remove container", runtime_id, &args).await?;
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        let args = vec!["rmi".to_string(), format!("{tag}:latest"), "-f".to_string()];
        self.exec("remove image", tag, &args).await?;
        Ok(())
    }
}
