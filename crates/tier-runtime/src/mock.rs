//! In-memory runtime for tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use tier_core::HealthStatus;

use crate::{ContainerRuntime, RuntimeError};

const MOCK_ID_PREFIX: &str = "mock-";

/// A call observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Build { context: String, tag: String },
    Run { tag: String, host_port: u16 },
    FindRunning { tag: String },
    InspectHealth { runtime_id: String },
    Stop { runtime_id: String },
    RemoveContainer { runtime_id: String },
    RemoveImage { tag: String },
}

#[derive(Debug, Default)]
struct MockState {
    images: HashSet<String>,
    /// tag -> published host port
    running: BTreeMap<String, u16>,
    /// tag -> stopped but not removed
    stopped: HashSet<String>,
    health: BTreeMap<String, HealthStatus>,
    fail_build: HashSet<String>,
    fail_run: HashSet<String>,
    fail_stop: HashSet<String>,
    calls: Vec<RuntimeCall>,
}

/// Container runtime that keeps all state in memory.
///
/// Runtime ids are `mock-<tag>`. Containers report `healthy` unless
/// overridden with [`MockRuntime::set_health`]. Failures can be injected per
/// tag for the build, run and stop steps, and an artificial latency can be
/// applied to build and run.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    latency: Duration,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `latency` inside every build and run call.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::default(),
            latency,
        }
    }

    pub fn fail_build(&self, tag: &str) {
        self.lock().fail_build.insert(tag.to_string());
    }

    pub fn fail_run(&self, tag: &str) {
        self.lock().fail_run.insert(tag.to_string());
    }

    pub fn fail_stop(&self, tag: &str) {
        self.lock().fail_stop.insert(tag.to_string());
    }

    pub fn set_health(&self, tag: &str, status: HealthStatus) {
        self.lock().health.insert(tag.to_string(), status);
    }

    pub fn is_running(&self, tag: &str) -> bool {
        self.lock().running.contains_key(tag)
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.lock().images.contains(tag)
    }

    /// Tags of running containers with their published ports.
    pub fn running(&self) -> Vec<(String, u16)> {
        self.lock()
            .running
            .iter()
            .map(|(tag, port)| (tag.clone(), *port))
            .collect()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means a test thread panicked mid-call
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: RuntimeCall) {
        self.lock().calls.push(call);
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn tag_of(runtime_id: &str) -> &str {
    runtime_id.strip_prefix(MOCK_ID_PREFIX).unwrap_or(runtime_id)
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build(&self, context: &str, tag: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Build {
            context: context.to_string(),
            tag: tag.to_string(),
        });
        self.simulate_latency().await;

        let mut state = self.lock();
        if state.fail_build.contains(tag) {
            return Err(RuntimeError::command_failed(
                "build",
                tag,
                Some(1),
                "[MOCK] build failure injected",
            ));
        }
        state.images.insert(tag.to_string());
        debug!(tag, context, "[MOCK] Image built");
        Ok(())
    }

    async fn run(
        &self,
        tag: &str,
        host_port: u16,
        cpu: f64,
        memory_mb: f64,
    ) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Run {
            tag: tag.to_string(),
            host_port,
        });
        self.simulate_latency().await;

        let mut state = self.lock();
        if state.fail_run.contains(tag) || !state.images.contains(tag) {
            return Err(RuntimeError::command_failed(
                "run",
                tag,
                Some(125),
                "[MOCK] run failure",
            ));
        }
        state.running.insert(tag.to_string(), host_port);
        info!(tag, host_port, cpu, memory_mb, "[MOCK] Container running");
        Ok(())
    }

    async fn find_running_id(&self, tag: &str) -> Result<Option<String>, RuntimeError> {
        self.record(RuntimeCall::FindRunning {
            tag: tag.to_string(),
        });
        let state = self.lock();
        Ok(state
            .running
            .contains_key(tag)
            .then(|| format!("{MOCK_ID_PREFIX}{tag}")))
    }

    async fn inspect_health(&self, runtime_id: &str) -> Result<HealthStatus, RuntimeError> {
        self.record(RuntimeCall::InspectHealth {
            runtime_id: runtime_id.to_string(),
        });
        let tag = tag_of(runtime_id);
        let state = self.lock();
        if !state.running.contains_key(tag) {
            return Err(RuntimeError::NotRunning(tag.to_string()));
        }
        Ok(state
            .health
            .get(tag)
            .copied()
            .unwrap_or(HealthStatus::Healthy))
    }

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Stop {
            runtime_id: runtime_id.to_string(),
        });
        let tag = tag_of(runtime_id);
        let mut state = self.lock();
        if state.fail_stop.contains(tag) {
            return Err(RuntimeError::command_failed(
                "stop",
                runtime_id,
                Some(1),
                "[MOCK] stop failure injected",
            ));
        }
        if state.running.remove(tag).is_none() {
            return Err(RuntimeError::NotRunning(tag.to_string()));
        }
        state.stopped.insert(tag.to_string());
        Ok(())
    }

    async fn remove_container(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RemoveContainer {
            runtime_id: runtime_id.to_string(),
        });
        let tag = tag_of(runtime_id);
        if !self.lock().stopped.remove(tag) {
            return Err(RuntimeError::command_failed(
                "remove container",
                runtime_id,
                Some(1),
                "[MOCK] no such stopped container",
            ));
        }
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RemoveImage {
            tag: tag.to_string(),
        });
        // Forced removal: a missing image is not an error
        self.lock().images.remove(tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_run_stop_cycle() {
        let runtime = MockRuntime::new();
        runtime.build("/models/a", "1").await.unwrap();
        runtime.run("1", 5001, 0.5, 256.0).await.unwrap();
        assert!(runtime.is_running("1"));

        let id = runtime.find_running_id("1").await.unwrap().unwrap();
        assert_eq!(id, "mock-1");
        assert_eq!(runtime.inspect_health(&id).await.unwrap(), HealthStatus::Healthy);

        runtime.stop(&id).await.unwrap();
        runtime.remove_container(&id).await.unwrap();
        runtime.remove_image("1").await.unwrap();
        assert!(!runtime.is_running("1"));
        assert!(!runtime.has_image("1"));
        assert_eq!(runtime.find_running_id("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let runtime = MockRuntime::new();
        runtime.fail_build("2");
        assert!(runtime.build("/m", "2").await.is_err());

        // Running an image that was never built fails
        assert!(runtime.run("3", 5000, 0.1, 10.0).await.is_err());

        runtime.build("/m", "4").await.unwrap();
        runtime.fail_run("4");
        assert!(runtime.run("4", 5000, 0.1, 10.0).await.is_err());
        assert!(!runtime.is_running("4"));
    }

    #[tokio::test]
    async fn test_health_override_and_not_running() {
        let runtime = MockRuntime::new();
        runtime.build("/m", "5").await.unwrap();
        runtime.run("5", 5000, 0.1, 10.0).await.unwrap();
        runtime.set_health("5", HealthStatus::Starting);
        assert_eq!(
            runtime.inspect_health("mock-5").await.unwrap(),
            HealthStatus::Starting
        );
        assert!(matches!(
            runtime.inspect_health("mock-6").await,
            Err(RuntimeError::NotRunning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_simulated() {
        let runtime = MockRuntime::with_latency(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        runtime.build("/m", "7").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(runtime.calls().len(), 1);
    }
}
