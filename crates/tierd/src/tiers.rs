//! Tier Directory: which tier a process belongs to, and what a tier grants.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;

use tier_core::{ProcessId, Tier, TierLevel, TierResources};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierDirectoryError {
    #[error("unknown user: {0}")]
    UnknownUser(ProcessId),

    #[error("unknown tier: {0}")]
    UnknownTier(TierLevel),

    #[error("tier directory unavailable: {0}")]
    Unavailable(String),
}

/// Source of tier assignments and entitlements.
///
/// Lookups for unknown identifiers fail; they never fall back to defaults.
#[async_trait]
pub trait TierDirectory: Send + Sync {
    async fn user_tier(&self, process_id: &ProcessId) -> Result<TierLevel, TierDirectoryError>;

    async fn tier_resources(&self, level: TierLevel) -> Result<TierResources, TierDirectoryError>;

    /// All tiers, ordered by level.
    async fn all_tiers(&self) -> Result<Vec<Tier>, TierDirectoryError>;
}

/// In-memory directory built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTierDirectory {
    tiers: BTreeMap<TierLevel, TierResources>,
    users: HashMap<ProcessId, TierLevel>,
}

impl StaticTierDirectory {
    pub fn new(
        tiers: impl IntoIterator<Item = Tier>,
        users: impl IntoIterator<Item = (ProcessId, TierLevel)>,
    ) -> Self {
        Self {
            tiers: tiers.into_iter().map(|t| (t.level, t.resources)).collect(),
            users: users.into_iter().collect(),
        }
    }

    /// The stock three-tier layout with users `user0`..`user9`.
    pub fn with_defaults() -> Self {
        Self::new(default_tiers(), default_users())
    }

    pub fn assign(&mut self, process_id: impl Into<ProcessId>, level: TierLevel) {
        self.users.insert(process_id.into(), level);
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }
}

#[async_trait]
impl TierDirectory for StaticTierDirectory {
    async fn user_tier(&self, process_id: &ProcessId) -> Result<TierLevel, TierDirectoryError> {
        self.users
            .get(process_id)
            .copied()
            .ok_or_else(|| TierDirectoryError::UnknownUser(process_id.clone()))
    }

    async fn tier_resources(&self, level: TierLevel) -> Result<TierResources, TierDirectoryError> {
        self.tiers
            .get(&level)
            .copied()
            .ok_or(TierDirectoryError::UnknownTier(level))
    }

    async fn all_tiers(&self) -> Result<Vec<Tier>, TierDirectoryError> {
        Ok(self
            .tiers
            .iter()
            .map(|(level, resources)| Tier {
                level: *level,
                resources: *resources,
            })
            .collect())
    }
}

/// Stock tiers: 20/10 blocks with a 30 s overload window, 10/5 with 10 s,
/// and 5 guaranteed with no overload.
pub fn default_tiers() -> Vec<Tier> {
    vec![
        Tier {
            level: TierLevel::new(1),
            resources: TierResources {
                guaranteed_blocks: 20,
                overload_blocks: 10,
                uptime_secs: 3600,
                overload_secs: 30,
                ports: 4,
            },
        },
        Tier {
            level: TierLevel::new(2),
            resources: TierResources {
                guaranteed_blocks: 10,
                overload_blocks: 5,
                uptime_secs: 1800,
                overload_secs: 10,
                ports: 2,
            },
        },
        Tier {
            level: TierLevel::new(3),
            resources: TierResources {
                guaranteed_blocks: 5,
                overload_blocks: 0,
                uptime_secs: 900,
                overload_secs: 0,
                ports: 1,
            },
        },
    ]
}

/// `user0`-`user3` at tier 1, `user4`-`user6` at tier 2, the rest at tier 3.
pub fn default_users() -> Vec<(ProcessId, TierLevel)> {
    (0..10u8)
        .map(|n| {
            let level = match n {
                0..=3 => 1,
                4..=6 => 2,
                _ => 3,
            };
            (ProcessId::new(format!("user{n}")), TierLevel::new(level))
        })
        .collect()
}
