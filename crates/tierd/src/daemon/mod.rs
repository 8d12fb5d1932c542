//! Platform daemons: one actor per tenant process.
//!
//! A daemon owns a capacity-bounded [`tier_core::ContainerStack`] and a
//! hashed [`tier_core::PortTable`], runs the container build/run/kill
//! sequences through a [`tier_runtime::ContainerRuntime`], and enforces its
//! uptime and overload windows on a periodic tick.
//!
//! ```text
//! Initializing ──▶ Monitoring ⇄ OverloadActive ──▶ ShuttingDown ──▶ Exited
//! ```
//!
//! Exits and elapsed overload windows are reported to the manager as
//! [`LifecycleEvent`]s over an unbounded channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tier_core::{ProcessId, TierLevel};
use tier_runtime::ContainerRuntime;

mod actor;
mod commands;
mod handle;

pub use actor::DaemonActor;
pub use commands::{DaemonCommand, LifecycleEvent, StartOutcome};
pub use handle::DaemonHandle;

const COMMAND_BUFFER: usize = 64;

/// Everything a daemon needs at spawn time.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub process_id: ProcessId,
    pub tier: TierLevel,
    /// Initial CPU ceiling (cores).
    pub cpu: f64,
    /// Initial memory ceiling (MB).
    pub memory_mb: f64,
    /// Host ports this daemon may hand to containers.
    pub ports: Vec<u16>,
    pub max_uptime: Duration,
    pub max_overload: Duration,
    pub tick: Duration,
    /// Host the containers' published ports are reachable on.
    pub forward_host: String,
}

/// Spawns a daemon actor and returns its handle.
pub fn spawn_daemon(
    config: DaemonConfig,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    events: mpsc::UnboundedSender<LifecycleEvent>,
) -> DaemonHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let handle = DaemonHandle::new(
        config.process_id.clone(),
        cmd_tx.clone(),
        Arc::clone(&runtime),
        http,
        config.forward_host.as_str(),
    );

    let actor = DaemonActor::new(config, cmd_rx, cmd_tx.downgrade(), runtime, events);
    tokio::spawn(actor.run());

    handle
}
