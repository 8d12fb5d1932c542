//! Read-only views of orchestrator state.
//!
//! These are produced by `tierd` and shipped over the control socket, so every
//! type here is plain data.

use crate::{ContainerId, Message, ProcessId, TierLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Daemon
// ============================================================================

/// Lifecycle state of a platform daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Initializing,
    Monitoring,
    OverloadActive,
    ShuttingDown,
    Exited,
}

impl DaemonState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Monitoring => "monitoring",
            Self::OverloadActive => "overload_active",
            Self::ShuttingDown => "shutting_down",
            Self::Exited => "exited",
        }
    }

    /// Whether the daemon still accepts container operations.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Monitoring | Self::OverloadActive)
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container as seen from outside its daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerView {
    pub id: ContainerId,
    pub cpu: f64,
    pub memory: f64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// False while the build/run sequence is still in flight.
    pub running: bool,
}

/// Point-in-time view of one daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSnapshot {
    pub process_id: ProcessId,
    pub state: DaemonState,
    pub capacity_cpu: f64,
    pub capacity_memory: f64,
    pub used_cpu: f64,
    pub used_memory: f64,
    pub overload_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overload_elapsed_secs: Option<u64>,
    pub max_overload_secs: u64,
    pub uptime_secs: u64,
    pub max_uptime_secs: u64,
    pub ports: Vec<u16>,
    pub containers: Vec<ContainerView>,
}

// ============================================================================
// Resource Monitor
// ============================================================================

/// Blocks held by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUsage {
    pub tier: TierLevel,
    pub guaranteed: u32,
    pub overload: u32,
}

impl BlockUsage {
    pub fn total(&self) -> u32 {
        self.guaranteed.saturating_add(self.overload)
    }
}

/// Point-in-time view of the global block and port ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub blocks_per_tier: Vec<u32>,
    pub usage: BTreeMap<ProcessId, BlockUsage>,
    pub deallocation_queue: Vec<ProcessId>,
    pub free_ports: usize,
    pub port_map: BTreeMap<ProcessId, Vec<u16>>,
}

impl MonitorSnapshot {
    /// Guaranteed blocks held by processes of `tier`.
    pub fn guaranteed_in_tier(&self, tier: TierLevel) -> u32 {
        self.usage
            .values()
            .filter(|u| u.tier == tier)
            .map(|u| u.guaranteed)
            .sum()
    }

    /// Guaranteed plus overload blocks across every process.
    pub fn total_in_use(&self) -> u32 {
        self.usage.values().map(BlockUsage::total).sum()
    }
}

/// Whole-system view: daemons, live queue and ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub daemons: Vec<DaemonSnapshot>,
    pub queue: Vec<Message>,
    pub monitor: MonitorSnapshot,
}

// ============================================================================
// Kill Report
// ============================================================================

/// One container that could not be torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillFailure {
    pub container_id: ContainerId,
    pub reason: String,
}

/// Aggregated outcome of a container kill batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub killed: Vec<ContainerId>,
    /// Containers that were not in the stack.
    pub skipped: Vec<ContainerId>,
    pub failed: Vec<KillFailure>,
}

impl KillReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: KillReport) {
        self.killed.extend(other.killed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_snapshot_totals() {
        let mut usage = BTreeMap::new();
        usage.insert(
            ProcessId::new("a"),
            BlockUsage {
                tier: TierLevel::new(1),
                guaranteed: 10,
                overload: 5,
            },
        );
        usage.insert(
            ProcessId::new("b"),
            BlockUsage {
                tier: TierLevel::new(2),
                guaranteed: 4,
                overload: 0,
            },
        );
        let snapshot = MonitorSnapshot {
            blocks_per_tier: vec![20, 10],
            usage,
            deallocation_queue: Vec::new(),
            free_ports: 3,
            port_map: BTreeMap::new(),
        };
        assert_eq!(snapshot.guaranteed_in_tier(TierLevel::new(1)), 10);
        assert_eq!(snapshot.guaranteed_in_tier(TierLevel::new(3)), 0);
        assert_eq!(snapshot.total_in_use(), 19);
    }

    #[test]
    fn test_kill_report_merge() {
        let mut report = KillReport {
            killed: vec![ContainerId::new(1)],
            ..Default::default()
        };
        report.merge(KillReport {
            skipped: vec![ContainerId::new(2)],
            failed: vec![KillFailure {
                container_id: ContainerId::new(3),
                reason: "stop failed".to_string(),
            }],
            ..Default::default()
        });
        assert_eq!(report.killed.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_daemon_state_liveness() {
        assert!(DaemonState::Monitoring.is_live());
        assert!(DaemonState::OverloadActive.is_live());
        assert!(!DaemonState::Initializing.is_live());
        assert!(!DaemonState::Exited.is_live());
        assert_eq!(DaemonState::OverloadActive.to_string(), "overload_active");
    }
}
