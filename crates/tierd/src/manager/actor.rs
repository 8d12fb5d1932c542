//! Manager actor - the single serialization point for the global ledger.
//!
//! The actor owns the message queue, the [`ResourceMonitor`] and the daemon
//! registry. Ledger mutations happen only here: queue processing on a tick,
//! lifecycle events from daemons, and monitor events drained after each
//! mutation.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failing message is recorded `FAILED`; it never stops the loop
//! - Responder send failures are ignored (the caller went away)

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tier_core::{
    Message, MessageId, MessageIntent, MessageLookup, MessageStatus, ProcessId, TierLevel,
};
use tier_runtime::ContainerRuntime;

use super::commands::{LedgerView, ManagerCommand};
use super::ManagerConfig;
use crate::daemon::{spawn_daemon, DaemonConfig, DaemonHandle, LifecycleEvent};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::monitor::{AllocationKind, MonitorEvent, ResourceMonitor};
use crate::tiers::TierDirectory;

/// Owns the queue, the ledger and the daemon registry.
pub struct ManagerActor {
    config: ManagerConfig,
    receiver: mpsc::Receiver<ManagerCommand>,
    directory: Arc<dyn TierDirectory>,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,

    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    lifecycle_rx: mpsc::UnboundedReceiver<LifecycleEvent>,

    queue: VecDeque<Message>,
    history: VecDeque<Message>,
    monitor: ResourceMonitor,
    daemons: HashMap<ProcessId, DaemonHandle>,
}

impl ManagerActor {
    pub fn new(
        config: ManagerConfig,
        receiver: mpsc::Receiver<ManagerCommand>,
        directory: Arc<dyn TierDirectory>,
        runtime: Arc<dyn ContainerRuntime>,
        http: reqwest::Client,
    ) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let monitor = ResourceMonitor::new(
            config.blocks_per_tier.clone(),
            config.ports.iter().copied(),
        );
        Self {
            config,
            receiver,
            directory,
            runtime,
            http,
            lifecycle_tx,
            lifecycle_rx,
            queue: VecDeque::new(),
            history: VecDeque::new(),
            monitor,
            daemons: HashMap::new(),
        }
    }

    /// Runs until a `Shutdown` command arrives or every sender is dropped.
    ///
    /// Lifecycle events are drained before commands so that a tick never
    /// sees a ledger entry for a daemon that has already exited.
    pub async fn run(mut self) {
        info!(
            blocks_per_tier = ?self.config.blocks_per_tier,
            ports = self.config.ports.len(),
            max_cpu = self.config.max_cpu,
            max_memory_mb = self.config.max_memory_mb,
            "Daemon manager started"
        );

        loop {
            tokio::select! {
                biased;

                Some(event) = self.lifecycle_rx.recv() => {
                    self.handle_lifecycle(event).await;
                }

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        warn!("All manager handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        info!("Daemon manager stopped");
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) -> ControlFlow<()> {
        match cmd {
            ManagerCommand::Enqueue {
                intent,
                tier,
                priority,
                respond_to,
            } => {
                let result = self.add_message_to_queue(intent, tier, priority).await;
                let _ = respond_to.send(result);
            }
            ManagerCommand::MessageStatus { id, respond_to } => {
                let _ = respond_to.send(self.fetch_message_status(&id));
            }
            ManagerCommand::Tick { respond_to } => {
                let head = self.process_head().await;
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(head);
                }
            }
            ManagerCommand::GetDaemon {
                process_id,
                respond_to,
            } => {
                let result = self
                    .daemons
                    .get(&process_id)
                    .cloned()
                    .ok_or(OrchestratorError::DaemonNotFound(process_id));
                let _ = respond_to.send(result);
            }
            ManagerCommand::KillProcess {
                process_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.kill_process(&process_id).await);
            }
            ManagerCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(LedgerView {
                    daemons: self.daemons.values().cloned().collect(),
                    queue: self.queue.iter().cloned().collect(),
                    monitor: self.monitor.snapshot(),
                });
            }
            ManagerCommand::Shutdown { respond_to } => {
                let codes = self.shutdown().await;
                let _ = respond_to.send(codes);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ========================================================================
    // Message Queue
    // ========================================================================

    /// Assigns an id and inserts the message behind every message with an
    /// equal or smaller `(tier, priority)` key.
    async fn add_message_to_queue(
        &mut self,
        intent: MessageIntent,
        tier: Option<TierLevel>,
        priority: u32,
    ) -> OrchestratorResult<MessageId> {
        let tier = match tier {
            Some(tier) => tier,
            None => self.directory.user_tier(intent.process_id()).await?,
        };

        let id = MessageId::new(Uuid::new_v4().to_string());
        let message = Message::new(id.clone(), intent, tier, priority);
        let key = message.order_key();
        let position = self.queue.partition_point(|m| m.order_key() <= key);

        debug!(
            message_id = %id,
            kind = message.intent.kind(),
            process_id = %message.intent.process_id(),
            tier = %tier,
            priority,
            position,
            "Message enqueued"
        );
        self.queue.insert(position, message);
        Ok(id)
    }

    /// Looks in the live queue first, then in history.
    fn fetch_message_status(&self, id: &MessageId) -> MessageLookup {
        if let Some((position, message)) = self.queue.iter().enumerate().find(|(_, m)| &m.id == id) {
            return MessageLookup::Queued {
                status: message.status,
                position,
                detail: message.detail.clone(),
            };
        }
        match self.history.iter().rev().find(|m| &m.id == id) {
            Some(message) => MessageLookup::Completed {
                status: message.status,
                detail: message.detail.clone(),
            },
            None => MessageLookup::NotFound,
        }
    }

    /// Attempts the head message and nothing behind it.
    ///
    /// Resource shortage leaves the head in place as `WAITING_FOR_RESOURCES`.
    /// Any other error dequeues it as `FAILED`.
    async fn process_head(&mut self) -> Option<Message> {
        let intent = self.queue.front()?.intent.clone();

        let result = match &intent {
            MessageIntent::Start { process_id } => self.spawn_new_daemon(process_id).await,
            MessageIntent::Overload { process_id } => {
                self.allocate_overload_blocks(process_id).await
            }
        };
        self.sync_monitor_events().await;

        match result {
            Ok(()) => {
                let mut message = self.queue.pop_front()?;
                message.complete(MessageStatus::Success, None);
                info!(
                    message_id = %message.id,
                    kind = intent.kind(),
                    process_id = %intent.process_id(),
                    "Message succeeded"
                );
                self.record(message.clone());
                Some(message)
            }
            Err(e) if e.is_resource_shortage() => {
                let message = self.queue.front_mut()?;
                if message.status != MessageStatus::WaitingForResources {
                    info!(
                        message_id = %message.id,
                        process_id = %intent.process_id(),
                        error = %e,
                        "Message waiting for resources"
                    );
                }
                message.status = MessageStatus::WaitingForResources;
                message.detail = Some(e.to_string());
                Some(message.clone())
            }
            Err(e) => {
                let mut message = self.queue.pop_front()?;
                warn!(
                    message_id = %message.id,
                    kind = intent.kind(),
                    process_id = %intent.process_id(),
                    code = e.code(),
                    error = %e,
                    "Message failed"
                );
                message.complete(MessageStatus::Failed, Some(e.to_string()));
                self.record(message.clone());
                Some(message)
            }
        }
    }

    fn record(&mut self, message: Message) {
        self.history.push_back(message);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates ports and guaranteed blocks, then starts and registers a
    /// daemon sized to its guarantee.
    async fn spawn_new_daemon(&mut self, process_id: &ProcessId) -> OrchestratorResult<()> {
        if self.daemons.contains_key(process_id) {
            return Err(OrchestratorError::AlreadyRegistered(process_id.clone()));
        }

        let tier = self.directory.user_tier(process_id).await?;
        let resources = self.directory.tier_resources(tier).await?;
        let allocation = self.monitor.allocate_process(process_id, tier, &resources)?;

        let blocks = f64::from(allocation.guaranteed);
        let config = DaemonConfig {
            process_id: process_id.clone(),
            tier,
            cpu: blocks * self.config.block_cpu(),
            memory_mb: blocks * self.config.block_memory(),
            ports: allocation.ports,
            max_uptime: resources.uptime(),
            max_overload: resources.overload_window(),
            tick: self.config.daemon_tick,
            forward_host: self.config.forward_host.clone(),
        };

        let handle = spawn_daemon(
            config,
            Arc::clone(&self.runtime),
            self.http.clone(),
            self.lifecycle_tx.clone(),
        );
        self.register_daemon(handle)
    }

    /// Grants overload blocks, grows the daemon and opens its overload window.
    async fn allocate_overload_blocks(&mut self, process_id: &ProcessId) -> OrchestratorResult<()> {
        let daemon = self
            .daemons
            .get(process_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::DaemonNotFound(process_id.clone()))?;
        let tier = self
            .monitor
            .usage_of(process_id)
            .map(|usage| usage.tier)
            .ok_or_else(|| OrchestratorError::ProcessNotTracked(process_id.clone()))?;
        let resources = self.directory.tier_resources(tier).await?;

        self.monitor
            .allocate_blocks(AllocationKind::Overload, process_id, tier, &resources)?;

        let enabled = match self.set_process_resources(process_id).await {
            Ok(()) => daemon.enable_overload().await,
            Err(e) => Err(e),
        };
        if let Err(e) = enabled {
            warn!(process_id = %process_id, error = %e, "Overload not enabled, returning blocks");
            self.monitor.deallocate_overload_blocks(process_id, 0)?;
            return Err(e);
        }
        Ok(())
    }

    /// Resizes a daemon to its current guaranteed plus overload blocks.
    async fn set_process_resources(&self, process_id: &ProcessId) -> OrchestratorResult<()> {
        let usage = self
            .monitor
            .usage_of(process_id)
            .ok_or_else(|| OrchestratorError::ProcessNotTracked(process_id.clone()))?;
        let daemon = self
            .daemons
            .get(process_id)
            .ok_or_else(|| OrchestratorError::DaemonNotFound(process_id.clone()))?;

        let blocks = f64::from(usage.total());
        let cpu = blocks * self.config.block_cpu();
        let memory = blocks * self.config.block_memory();
        let evicted = daemon.set_resource_limits(cpu, memory).await?;

        debug!(process_id = %process_id, blocks = usage.total(), cpu, memory, "Daemon resized");
        if !evicted.is_empty() {
            warn!(process_id = %process_id, evicted = ?evicted, "Containers evicted to fit new limits");
        }
        Ok(())
    }

    /// Applies monitor notifications queued by the last ledger mutation.
    async fn sync_monitor_events(&mut self) {
        for event in self.monitor.drain_events() {
            match event {
                MonitorEvent::OverloadDeallocated {
                    process_id,
                    released,
                } => {
                    debug!(process_id = %process_id, released, "Shrinking daemon after reclamation");
                    if let Err(e) = self.set_process_resources(&process_id).await {
                        warn!(process_id = %process_id, error = %e, "Failed to shrink daemon");
                    }
                }
            }
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    fn register_daemon(&mut self, handle: DaemonHandle) -> OrchestratorResult<()> {
        let process_id = handle.process_id().clone();
        if self.daemons.contains_key(&process_id) {
            return Err(OrchestratorError::AlreadyRegistered(process_id));
        }
        info!(process_id = %process_id, daemons = self.daemons.len() + 1, "Daemon registered");
        self.daemons.insert(process_id, handle);
        Ok(())
    }

    fn unregister_daemon(&mut self, process_id: &ProcessId) -> OrchestratorResult<DaemonHandle> {
        let handle = self
            .daemons
            .remove(process_id)
            .ok_or_else(|| OrchestratorError::DaemonNotFound(process_id.clone()))?;
        info!(process_id = %process_id, daemons = self.daemons.len(), "Daemon unregistered");
        Ok(handle)
    }

    async fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Exited { process_id, code } => {
                info!(process_id = %process_id, code, "Daemon exited");
                if let Err(e) = self.unregister_daemon(&process_id) {
                    debug!(process_id = %process_id, error = %e, "Exit for unknown daemon");
                }
                if let Err(e) = self.monitor.process_exit_cleanup(&process_id) {
                    debug!(process_id = %process_id, error = %e, "Nothing to clean up");
                }
            }
            LifecycleEvent::OverloadExited { process_id } => {
                if let Err(e) = self.monitor.enqueue_for_deallocation(&process_id) {
                    debug!(process_id = %process_id, error = %e, "Overload exit for untracked process");
                }
            }
        }
        self.sync_monitor_events().await;
    }

    async fn kill_process(&self, process_id: &ProcessId) -> OrchestratorResult<()> {
        let daemon = self
            .daemons
            .get(process_id)
            .ok_or_else(|| OrchestratorError::DaemonNotFound(process_id.clone()))?;
        match daemon.request_shutdown().await {
            Ok(()) => {
                info!(process_id = %process_id, "Daemon kill requested");
                Ok(())
            }
            // Already on its way out; the exit event will follow
            Err(OrchestratorError::ChannelClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Shuts every daemon down concurrently and clears the ledger.
    async fn shutdown(&mut self) -> Vec<(ProcessId, i32)> {
        info!(daemons = self.daemons.len(), queued = self.queue.len(), "Manager shutting down");

        let daemons: Vec<DaemonHandle> = self.daemons.drain().map(|(_, handle)| handle).collect();
        let codes = join_all(daemons.iter().map(|daemon| async move {
            let code = match daemon.shutdown().await {
                Ok(code) => code,
                Err(e) => {
                    error!(process_id = %daemon.process_id(), error = %e, "Daemon did not report exit");
                    1
                }
            };
            (daemon.process_id().clone(), code)
        }))
        .await;

        self.monitor.clear();
        self.receiver.close();
        codes
    }
}
