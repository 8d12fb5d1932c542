//! Daemon manager using the actor pattern.
//!
//! The manager is the only writer of the global ledger. It turns queued
//! allocation requests into [`crate::monitor::ResourceMonitor`] decisions and
//! daemon lifecycles, and reacts to lifecycle events from its daemons.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  ManagerCommand  ┌─────────────────┐  DaemonCommand  ┌─────────────────┐
//! │  ManagerHandle  │─────────────────▶│  ManagerActor   │────────────────▶│  DaemonActor    │
//! └─────────────────┘   (mpsc)         │                 │    (mpsc)       │  (per process)  │
//!         ▲                            │ queue, monitor, │◀────────────────└─────────────────┘
//!         │ Tick                       │ daemon registry │ LifecycleEvent
//! ┌─────────────────┐                  └─────────────────┘   (unbounded)
//! │   Ticker task   │
//! └─────────────────┘
//! ```
//!
//! One queue message is advanced per tick. A message that hits a resource
//! shortage stays at the head as `WAITING_FOR_RESOURCES` and blocks
//! everything behind it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use tier_runtime::ContainerRuntime;

use crate::tiers::TierDirectory;

mod actor;
mod commands;
mod handle;

pub use actor::ManagerActor;
pub use commands::{LedgerView, ManagerCommand};
pub use handle::ManagerHandle;

const COMMAND_BUFFER: usize = 100;

/// Timeout for a forwarded request, connect to last byte.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Sizing and timing of the manager and the daemons it spawns.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// CPU cores shared by every block.
    pub max_cpu: f64,
    /// Memory (MB) shared by every block.
    pub max_memory_mb: f64,
    /// Block budget of tier `i + 1` at index `i`.
    pub blocks_per_tier: Vec<u32>,
    /// Host ports handed out to daemons.
    pub ports: Vec<u16>,
    /// Queue processing interval. `None` disables the ticker.
    pub tick: Option<Duration>,
    pub daemon_tick: Duration,
    /// Terminal messages kept for status lookups.
    pub history_limit: usize,
    pub forward_host: String,
}

impl ManagerConfig {
    /// CPU cores per block.
    pub fn block_cpu(&self) -> f64 {
        per_block(self.max_cpu, self.total_blocks())
    }

    /// Memory (MB) per block.
    pub fn block_memory(&self) -> f64 {
        per_block(self.max_memory_mb, self.total_blocks())
    }

    pub fn total_blocks(&self) -> u32 {
        self.blocks_per_tier.iter().sum()
    }
}

fn per_block(total: f64, blocks: u32) -> f64 {
    if blocks == 0 {
        0.0
    } else {
        total / f64::from(blocks)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_cpu: 12.0,
            max_memory_mb: 12_288.0,
            blocks_per_tier: vec![40, 30, 50],
            ports: (5000..5100).collect(),
            tick: Some(Duration::from_secs(1)),
            daemon_tick: Duration::from_secs(1),
            history_limit: 1000,
            forward_host: "127.0.0.1".to_string(),
        }
    }
}

/// Spawns the manager actor (and its ticker, if enabled) and returns a handle.
pub fn spawn_manager(
    config: ManagerConfig,
    directory: Arc<dyn TierDirectory>,
    runtime: Arc<dyn ContainerRuntime>,
) -> ManagerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let http = reqwest::Client::builder()
        .timeout(FORWARD_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        });

    let tick = config.tick;
    let actor = ManagerActor::new(config, cmd_rx, directory, runtime, http);
    tokio::spawn(actor.run());

    if let Some(period) = tick {
        spawn_ticker(cmd_tx.clone(), period);
    }

    ManagerHandle::new(cmd_tx)
}

/// Drives queue processing until the manager stops.
fn spawn_ticker(sender: mpsc::Sender<ManagerCommand>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if sender
                .send(ManagerCommand::Tick { respond_to: None })
                .await
                .is_err()
            {
                debug!("Ticker stopping: manager channel closed");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_conversion() {
        let config = ManagerConfig {
            max_cpu: 4.0,
            max_memory_mb: 4096.0,
            blocks_per_tier: vec![2, 1, 1],
            ..ManagerConfig::default()
        };
        assert_eq!(config.total_blocks(), 4);
        assert_eq!(config.block_cpu(), 1.0);
        assert_eq!(config.block_memory(), 1024.0);
    }

    #[test]
    fn test_zero_blocks_yield_zero_sizes() {
        let config = ManagerConfig {
            blocks_per_tier: vec![],
            ..ManagerConfig::default()
        };
        assert_eq!(config.block_cpu(), 0.0);
    }
}
