//! Service tiers and their resource entitlements.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Service tier level. Level 1 is the highest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierLevel(u8);

impl TierLevel {
    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Zero-based index into a blocks-per-tier table (`level - 1`).
    ///
    /// Returns `None` for level 0, which is never a valid tier.
    pub fn index(self) -> Option<usize> {
        usize::from(self.0).checked_sub(1)
    }

    /// Returns true if `other` is at this tier or a lower-priority one.
    pub fn covers(self, other: TierLevel) -> bool {
        other.0 >= self.0
    }
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a tier entitles a process to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierResources {
    /// Blocks reserved for the process's whole lifetime.
    pub guaranteed_blocks: u32,
    /// Extra preemptible blocks granted per overload request.
    pub overload_blocks: u32,
    /// Maximum daemon lifetime in seconds.
    pub uptime_secs: u64,
    /// Length of one overload window in seconds.
    pub overload_secs: u64,
    /// Host ports reserved for the daemon.
    pub ports: u32,
}

impl TierResources {
    pub fn uptime(&self) -> Duration {
        Duration::from_secs(self.uptime_secs)
    }

    pub fn overload_window(&self) -> Duration {
        Duration::from_secs(self.overload_secs)
    }
}

/// A tier as listed by the Tier Directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub level: TierLevel,
    #[serde(flatten)]
    pub resources: TierResources,
}
