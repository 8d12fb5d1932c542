//! Platform daemon actor - owns one process's containers, ports and timers.
//!
//! Runtime calls (build, run, stop) never run on the actor loop itself. They
//! are spawned onto the daemon's task tracker and report back through the
//! command channel, so ticks keep firing while containers start.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Responder send failures are ignored (the caller went away)
//! - Lifecycle event send failures are logged (the manager went away)

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use tier_core::{
    Container, ContainerId, ContainerStack, ContainerView, DaemonSnapshot, DaemonState,
    KillFailure, KillReport, PortTable, ProcessId,
};
use tier_runtime::{ContainerRuntime, RuntimeError};

use super::commands::{DaemonCommand, LifecycleEvent, StartOutcome};
use super::DaemonConfig;
use crate::error::{OrchestratorError, OrchestratorResult};

/// A container whose build/run is still in flight.
struct PendingStart {
    respond_to: Option<oneshot::Sender<OrchestratorResult<u16>>>,
    cancel: CancellationToken,
}

/// What stopped the actor loop.
enum Exit {
    /// Shutdown command, possibly with a caller waiting for the code.
    Requested(Option<oneshot::Sender<i32>>),
    UptimeExpired,
    /// Every handle was dropped.
    Orphaned,
}

// ============================================================================
// Daemon Actor
// ============================================================================

/// Per-process supervisor of a bounded set of containers.
///
/// Owns the [`ContainerStack`] and [`PortTable`] for its process; nothing
/// else mutates them. Holds only a weak sender to its own channel so that
/// dropping every [`super::DaemonHandle`] shuts it down.
pub struct DaemonActor {
    config: DaemonConfig,
    receiver: mpsc::Receiver<DaemonCommand>,
    reporter: mpsc::WeakSender<DaemonCommand>,
    runtime: Arc<dyn ContainerRuntime>,
    events: mpsc::UnboundedSender<LifecycleEvent>,

    stack: ContainerStack,
    ports: PortTable,
    running: BTreeSet<ContainerId>,
    starting: HashMap<ContainerId, PendingStart>,

    state: DaemonState,
    created_at: Instant,
    overload_started: Option<Instant>,

    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl DaemonActor {
    pub fn new(
        config: DaemonConfig,
        receiver: mpsc::Receiver<DaemonCommand>,
        reporter: mpsc::WeakSender<DaemonCommand>,
        runtime: Arc<dyn ContainerRuntime>,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Self {
        let stack = ContainerStack::new(config.cpu, config.memory_mb);
        let ports = PortTable::new(config.ports.iter().copied());
        Self {
            config,
            receiver,
            reporter,
            runtime,
            events,
            stack,
            ports,
            running: BTreeSet::new(),
            starting: HashMap::new(),
            state: DaemonState::Initializing,
            created_at: Instant::now(),
            overload_started: None,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Runs the tick loop until uptime expires or shutdown is requested,
    /// then tears everything down and reports `Exited`.
    pub async fn run(mut self) {
        let process_id = self.config.process_id.clone();
        info!(
            process_id = %process_id,
            tier = %self.config.tier,
            cpu = self.config.cpu,
            memory_mb = self.config.memory_mb,
            ports = ?self.config.ports,
            "Platform daemon starting"
        );

        self.created_at = Instant::now();
        self.state = DaemonState::Monitoring;

        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let exit = tokio::select! {
                biased;

                _ = ticker.tick() => self.on_tick(Instant::now()),

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => Some(Exit::Orphaned),
                },
            };

            if let Some(exit) = exit {
                break exit;
            }
        };

        let mut waiters = Vec::new();
        match exit {
            Exit::Requested(respond_to) => {
                info!(process_id = %process_id, "Shutdown requested");
                waiters.extend(respond_to);
            }
            Exit::UptimeExpired => {
                info!(process_id = %process_id, "Maximum uptime reached");
            }
            Exit::Orphaned => {
                warn!(process_id = %process_id, "All daemon handles dropped");
            }
        }

        let code = self.shutdown(&mut waiters).await;
        self.state = DaemonState::Exited;

        for waiter in waiters {
            let _ = waiter.send(code);
        }
        if self
            .events
            .send(LifecycleEvent::Exited {
                process_id: process_id.clone(),
                code,
            })
            .is_err()
        {
            debug!(process_id = %process_id, "Manager gone, exit not reported");
        }
        info!(process_id = %process_id, code, "Platform daemon exited");
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn on_tick(&mut self, now: Instant) -> Option<Exit> {
        if now.duration_since(self.created_at) >= self.config.max_uptime {
            return Some(Exit::UptimeExpired);
        }

        if let Some(started) = self.overload_started {
            if now.duration_since(started) >= self.config.max_overload {
                self.overload_started = None;
                self.state = DaemonState::Monitoring;
                info!(process_id = %self.config.process_id, "Overload window elapsed");
                self.emit(LifecycleEvent::OverloadExited {
                    process_id: self.config.process_id.clone(),
                });
            }
        }

        None
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.events.send(event).is_err() {
            debug!(process_id = %self.config.process_id, "Manager gone, event dropped");
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_command(&mut self, cmd: DaemonCommand) -> Option<Exit> {
        match cmd {
            DaemonCommand::InitializeContainer {
                container,
                respond_to,
            } => self.handle_initialize(container, respond_to),
            DaemonCommand::ContainerStarted {
                container_id,
                outcome,
            } => self.handle_started(container_id, outcome),
            DaemonCommand::LookupPort {
                container_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.lookup_port(container_id));
            }
            DaemonCommand::KillContainers {
                container_ids,
                respond_to,
            } => self.handle_kill(container_ids, respond_to),
            DaemonCommand::SetResourceLimits {
                cpu,
                memory,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_set_limits(cpu, memory));
            }
            DaemonCommand::EnableOverload { respond_to } => {
                let _ = respond_to.send(self.handle_enable_overload());
            }
            DaemonCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            DaemonCommand::Shutdown { respond_to } => return Some(Exit::Requested(respond_to)),
        }
        None
    }

    fn handle_initialize(
        &mut self,
        container: Container,
        respond_to: oneshot::Sender<OrchestratorResult<u16>>,
    ) {
        let container_id = container.id;

        if !self.state.is_live() {
            let _ = respond_to.send(Err(OrchestratorError::DaemonUnavailable(
                self.config.process_id.clone(),
            )));
            return;
        }

        if self.stack.exists(container_id) {
            let _ = respond_to.send(Err(OrchestratorError::DuplicateContainer {
                process_id: self.config.process_id.clone(),
                container_id,
            }));
            return;
        }

        if let Err(e) = self.stack.push(container.clone()) {
            warn!(process_id = %self.config.process_id, error = %e, "Container rejected");
            let _ = respond_to.send(Err(e.into()));
            return;
        }

        let port = match self.ports.allocate(container_id) {
            Ok(port) => port,
            Err(e) => {
                self.stack.remove(container_id);
                let _ = respond_to.send(Err(e.into()));
                return;
            }
        };

        let cancel = self.cancel.child_token();
        self.starting.insert(
            container_id,
            PendingStart {
                respond_to: Some(respond_to),
                cancel: cancel.clone(),
            },
        );

        debug!(
            process_id = %self.config.process_id,
            container_id = %container_id,
            port,
            "Starting container"
        );

        let runtime = Arc::clone(&self.runtime);
        let reporter = self.reporter.clone();
        let owner = self.config.process_id.clone();
        self.tasks
            .spawn(run_starter(runtime, owner, container, port, cancel, reporter));
    }

    fn handle_started(&mut self, container_id: ContainerId, outcome: StartOutcome) {
        let Some(mut pending) = self.starting.remove(&container_id) else {
            // Evicted while starting; nothing left in the ledger
            if matches!(outcome, StartOutcome::Started) {
                self.spawn_teardown(vec![container_id]);
            }
            return;
        };

        let result = match outcome {
            StartOutcome::Started if pending.cancel.is_cancelled() => {
                self.release(container_id);
                self.spawn_teardown(vec![container_id]);
                Err(OrchestratorError::ContainerStartFailed {
                    container_id,
                    reason: "killed while starting".to_string(),
                })
            }
            StartOutcome::Started => match self.ports.lookup(container_id) {
                Ok(port) => {
                    self.running.insert(container_id);
                    info!(
                        process_id = %self.config.process_id,
                        container_id = %container_id,
                        port,
                        "Container running"
                    );
                    Ok(port)
                }
                Err(e) => {
                    self.release(container_id);
                    self.spawn_teardown(vec![container_id]);
                    Err(e.into())
                }
            },
            StartOutcome::Failed(err) => {
                warn!(
                    process_id = %self.config.process_id,
                    container_id = %container_id,
                    error = %err,
                    "Container failed to start, rolling back"
                );
                self.release(container_id);
                Err(OrchestratorError::start_failed(container_id, &err))
            }
            StartOutcome::Cancelled => {
                self.release(container_id);
                Err(OrchestratorError::ContainerStartFailed {
                    container_id,
                    reason: "killed while starting".to_string(),
                })
            }
        };

        if let Some(respond_to) = pending.respond_to.take() {
            let _ = respond_to.send(result);
        }
    }

    fn lookup_port(&self, container_id: ContainerId) -> OrchestratorResult<u16> {
        if self.starting.contains_key(&container_id) {
            return Err(OrchestratorError::ContainerNotRunning { container_id });
        }
        self.ports.lookup(container_id).map_err(Into::into)
    }

    fn handle_kill(&mut self, container_ids: Vec<ContainerId>, respond_to: oneshot::Sender<KillReport>) {
        let mut report = KillReport::default();
        let mut doomed = Vec::new();
        let unique: BTreeSet<ContainerId> = container_ids.into_iter().collect();

        for container_id in unique {
            if !self.stack.exists(container_id) {
                debug!(
                    process_id = %self.config.process_id,
                    container_id = %container_id,
                    "Container not in stack, skipping kill"
                );
                report.skipped.push(container_id);
                continue;
            }

            if let Some(pending) = self.starting.get(&container_id) {
                pending.cancel.cancel();
                report.failed.push(KillFailure {
                    container_id,
                    reason: OrchestratorError::ContainerNotRunning { container_id }.to_string(),
                });
                continue;
            }

            self.release(container_id);
            doomed.push(container_id);
        }

        let runtime = Arc::clone(&self.runtime);
        let owner = self.config.process_id.clone();
        self.tasks.spawn(async move {
            report.merge(teardown_all(runtime.as_ref(), &owner, doomed).await);
            let _ = respond_to.send(report);
        });
    }

    fn handle_set_limits(&mut self, cpu: f64, memory: f64) -> Vec<ContainerId> {
        self.stack.set_capacity(cpu, memory);

        let mut evicted = Vec::new();
        let mut doomed = Vec::new();
        while !self.stack.usage().fits() {
            let Some(top) = self.stack.top().map(|c| c.id) else {
                break;
            };

            if let Some(mut pending) = self.starting.remove(&top) {
                pending.cancel.cancel();
                if let Some(respond_to) = pending.respond_to.take() {
                    let _ = respond_to.send(Err(OrchestratorError::ContainerStartFailed {
                        container_id: top,
                        reason: "evicted by resource limit change".to_string(),
                    }));
                }
            } else {
                doomed.push(top);
            }

            self.release(top);
            evicted.push(top);
        }

        info!(
            process_id = %self.config.process_id,
            cpu,
            memory,
            evicted = evicted.len(),
            "Resource limits updated"
        );

        if !doomed.is_empty() {
            self.spawn_teardown(doomed);
        }
        evicted
    }

    fn handle_enable_overload(&mut self) -> OrchestratorResult<()> {
        if !self.state.is_live() {
            return Err(OrchestratorError::DaemonUnavailable(
                self.config.process_id.clone(),
            ));
        }
        self.overload_started = Some(Instant::now());
        self.state = DaemonState::OverloadActive;
        info!(
            process_id = %self.config.process_id,
            window_secs = self.config.max_overload.as_secs(),
            "Overload mode enabled"
        );
        Ok(())
    }

    fn snapshot(&self) -> DaemonSnapshot {
        let usage = self.stack.usage();
        let now = Instant::now();
        DaemonSnapshot {
            process_id: self.config.process_id.clone(),
            state: self.state,
            capacity_cpu: usage.capacity_cpu,
            capacity_memory: usage.capacity_memory,
            used_cpu: usage.used_cpu,
            used_memory: usage.used_memory,
            overload_active: self.overload_started.is_some(),
            overload_elapsed_secs: self
                .overload_started
                .map(|started| now.duration_since(started).as_secs()),
            max_overload_secs: self.config.max_overload.as_secs(),
            uptime_secs: now.duration_since(self.created_at).as_secs(),
            max_uptime_secs: self.config.max_uptime.as_secs(),
            ports: self.config.ports.clone(),
            containers: self
                .stack
                .members()
                .iter()
                .map(|c| ContainerView {
                    id: c.id,
                    cpu: c.cpu,
                    memory: c.memory,
                    model: c.model.clone(),
                    port: self.ports.lookup(c.id).ok(),
                    running: self.running.contains(&c.id),
                })
                .collect(),
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Drops a container from the stack, port table and running set.
    fn release(&mut self, container_id: ContainerId) {
        if let Err(e) = self.ports.release(container_id) {
            debug!(container_id = %container_id, error = %e, "No port to release");
        }
        self.stack.remove(container_id);
        self.running.remove(&container_id);
    }

    /// Tears containers down in the background, logging failures.
    fn spawn_teardown(&self, container_ids: Vec<ContainerId>) {
        let runtime = Arc::clone(&self.runtime);
        let process_id = self.config.process_id.clone();
        self.tasks.spawn(async move {
            let report = teardown_all(runtime.as_ref(), &process_id, container_ids).await;
            for failure in &report.failed {
                error!(
                    process_id = %process_id,
                    container_id = %failure.container_id,
                    reason = %failure.reason,
                    "Background teardown failed"
                );
            }
        });
    }

    /// Stops the timers, kills every container and waits for in-flight
    /// runtime work. Returns the exit code.
    async fn shutdown(&mut self, waiters: &mut Vec<oneshot::Sender<i32>>) -> i32 {
        self.state = DaemonState::ShuttingDown;
        self.cancel.cancel();

        // Starters still in flight tear their containers down themselves
        for (container_id, mut pending) in self.starting.drain() {
            if let Some(respond_to) = pending.respond_to.take() {
                let _ = respond_to.send(Err(OrchestratorError::ContainerStartFailed {
                    container_id,
                    reason: "daemon shutting down".to_string(),
                }));
            }
        }

        self.receiver.close();
        let mut orphans = Vec::new();
        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                DaemonCommand::ContainerStarted {
                    container_id,
                    outcome: StartOutcome::Started,
                } => orphans.push(container_id),
                DaemonCommand::Shutdown {
                    respond_to: Some(respond_to),
                } => waiters.push(respond_to),
                DaemonCommand::KillContainers { respond_to, .. } => {
                    let _ = respond_to.send(KillReport::default());
                }
                _ => {}
            }
        }
        if !orphans.is_empty() {
            self.spawn_teardown(orphans);
        }

        let doomed: Vec<ContainerId> = self.running.iter().copied().collect();
        for container_id in &doomed {
            self.release(*container_id);
        }
        let report = teardown_all(self.runtime.as_ref(), &self.config.process_id, doomed).await;

        self.tasks.close();
        self.tasks.wait().await;

        if report.is_clean() {
            0
        } else {
            for failure in &report.failed {
                error!(
                    process_id = %self.config.process_id,
                    container_id = %failure.container_id,
                    reason = %failure.reason,
                    "Container kill failed during shutdown"
                );
            }
            1
        }
    }
}

// ============================================================================
// Runtime Sequences
// ============================================================================

/// Builds the image and runs it on `port`.
///
/// A failed run removes the freshly built image again.
async fn start_container(
    runtime: &dyn ContainerRuntime,
    owner: &ProcessId,
    container: &Container,
    port: u16,
) -> Result<(), RuntimeError> {
    let tag = container.id.tag(owner);
    runtime.build(&container.model, &tag).await?;

    if let Err(e) = runtime.run(&tag, port, container.cpu, container.memory).await {
        if let Err(cleanup) = runtime.remove_image(&tag).await {
            debug!(tag = %tag, error = %cleanup, "Image cleanup after failed run failed");
        }
        return Err(e);
    }
    Ok(())
}

/// Stop, remove container, remove image.
async fn teardown(
    runtime: &dyn ContainerRuntime,
    owner: &ProcessId,
    container_id: ContainerId,
) -> Result<(), RuntimeError> {
    let tag = container_id.tag(owner);
    let runtime_id = runtime
        .find_running_id(&tag)
        .await?
        .ok_or_else(|| RuntimeError::NotRunning(tag.clone()))?;
    runtime.stop(&runtime_id).await?;
    runtime.remove_container(&runtime_id).await?;
    runtime.remove_image(&tag).await
}

/// Tears down every container concurrently and collects the outcomes.
async fn teardown_all(
    runtime: &dyn ContainerRuntime,
    owner: &ProcessId,
    container_ids: Vec<ContainerId>,
) -> KillReport {
    let outcomes = join_all(container_ids.into_iter().map(|container_id| async move {
        (container_id, teardown(runtime, owner, container_id).await)
    }))
    .await;

    let mut report = KillReport::default();
    for (container_id, outcome) in outcomes {
        match outcome {
            Ok(()) => report.killed.push(container_id),
            Err(e) => report.failed.push(KillFailure {
                container_id,
                reason: e.to_string(),
            }),
        }
    }
    report
}

/// Body of the task that starts one container.
async fn run_starter(
    runtime: Arc<dyn ContainerRuntime>,
    owner: ProcessId,
    container: Container,
    port: u16,
    cancel: CancellationToken,
    reporter: mpsc::WeakSender<DaemonCommand>,
) {
    let container_id = container.id;
    let result = start_container(runtime.as_ref(), &owner, &container, port).await;

    let outcome = match result {
        Ok(()) if cancel.is_cancelled() => {
            if let Err(e) = teardown(runtime.as_ref(), &owner, container_id).await {
                warn!(container_id = %container_id, error = %e, "Teardown of cancelled container failed");
            }
            StartOutcome::Cancelled
        }
        Ok(()) => StartOutcome::Started,
        Err(e) => StartOutcome::Failed(e),
    };
    let started = matches!(outcome, StartOutcome::Started);

    let delivered = match reporter.upgrade() {
        Some(sender) => sender
            .send(DaemonCommand::ContainerStarted {
                container_id,
                outcome,
            })
            .await
            .is_ok(),
        None => false,
    };

    if !delivered && started {
        warn!(container_id = %container_id, "Daemon gone before container started, tearing down");
        if let Err(e) = teardown(runtime.as_ref(), &owner, container_id).await {
            error!(container_id = %container_id, error = %e, "Orphaned container teardown failed");
        }
    }
}
