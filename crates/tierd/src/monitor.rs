//! Global tiered block and port ledger.
//!
//! The [`ResourceMonitor`] decides whether a spawn (guaranteed blocks) or an
//! overload (preemptible extra blocks) request can be satisfied, reclaiming
//! expired overload grants from the deallocation queue when it has to.
//!
//! # Accounting
//!
//! Each tier has a block budget. A tier's occupancy is the guaranteed plus
//! overload blocks of its processes.
//!
//! - Spawn headroom at tier `t` is `budget[t] - occupancy(t)`, capped by the
//!   global free blocks.
//! - Overload headroom at tier `t` is the summed budget of tiers `>= t` minus
//!   their summed occupancy, capped by the global free blocks. Overload can
//!   borrow from lower-priority tiers, never from higher ones.
//!
//! Every process's tier is recorded when it is allocated, so all filtering
//! here is synchronous over that record.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()` or direct indexing; tier budgets are read with
//! `get` and arithmetic saturates.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info, warn};

use tier_core::{BlockUsage, MonitorSnapshot, ProcessId, TierLevel, TierResources};

use crate::error::{OrchestratorError, OrchestratorResult, ResourceAllocationError};
use crate::tiers::TierDirectoryError;

/// Which kind of blocks a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Spawn,
    Overload,
}

/// Notifications the manager drains after every ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A process lost its overload blocks; its daemon must shrink.
    OverloadDeallocated {
        process_id: ProcessId,
        released: u32,
    },
}

/// Result of a successful [`ResourceMonitor::allocate_process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessAllocation {
    pub ports: Vec<u16>,
    pub guaranteed: u32,
}

/// Tiered block and port ledger. Owned by the manager actor.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    blocks_per_tier: Vec<u32>,
    usage: BTreeMap<ProcessId, BlockUsage>,
    deallocation_queue: VecDeque<ProcessId>,
    port_pool: BTreeSet<u16>,
    port_map: BTreeMap<ProcessId, Vec<u16>>,
    events: Vec<MonitorEvent>,
}

impl ResourceMonitor {
    /// `blocks_per_tier[i]` is the budget of tier `i + 1`.
    pub fn new(blocks_per_tier: Vec<u32>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            blocks_per_tier,
            usage: BTreeMap::new(),
            deallocation_queue: VecDeque::new(),
            port_pool: ports.into_iter().collect(),
            port_map: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.blocks_per_tier.iter().sum()
    }

    pub fn blocks_per_tier(&self) -> &[u32] {
        &self.blocks_per_tier
    }

    pub fn usage_of(&self, process_id: &ProcessId) -> Option<BlockUsage> {
        self.usage.get(process_id).copied()
    }

    pub fn ports_of(&self, process_id: &ProcessId) -> Option<&[u16]> {
        self.port_map.get(process_id).map(Vec::as_slice)
    }

    pub fn is_tracked(&self, process_id: &ProcessId) -> bool {
        self.usage.contains_key(process_id)
    }

    pub fn free_ports(&self) -> usize {
        self.port_pool.len()
    }

    pub fn deallocation_queue(&self) -> impl Iterator<Item = &ProcessId> {
        self.deallocation_queue.iter()
    }

    /// Takes the pending notifications.
    pub fn drain_events(&mut self) -> Vec<MonitorEvent> {
        std::mem::take(&mut self.events)
    }

    // ========================================================================
    // Ports
    // ========================================================================

    /// Reserves `count` ports from the global pool, all or nothing.
    ///
    /// # Errors
    /// - `ResourceAllocationError::Ports` if fewer than `count` remain
    pub fn allocate_ports(
        &mut self,
        count: u32,
        process_id: &ProcessId,
    ) -> OrchestratorResult<Vec<u16>> {
        let wanted = usize::try_from(count).unwrap_or(usize::MAX);
        if self.port_pool.len() < wanted {
            warn!(
                process_id = %process_id,
                requested = count,
                available = self.port_pool.len(),
                "Port pool exhausted"
            );
            return Err(ResourceAllocationError::Ports {
                process_id: process_id.clone(),
                requested: count,
                available: self.port_pool.len(),
            }
            .into());
        }

        let mut granted = Vec::with_capacity(wanted);
        while granted.len() < wanted {
            match self.port_pool.pop_first() {
                Some(port) => granted.push(port),
                None => break,
            }
        }

        self.port_map
            .entry(process_id.clone())
            .or_default()
            .extend(granted.iter().copied());
        debug!(process_id = %process_id, ports = ?granted, "Ports reserved");
        Ok(granted)
    }

    fn release_ports(&mut self, process_id: &ProcessId) -> usize {
        let ports = self.port_map.remove(process_id).unwrap_or_default();
        let released = ports.len();
        self.port_pool.extend(ports);
        released
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    /// Runs the tiered allocation algorithm for one request.
    ///
    /// Spawn commits `guaranteed_blocks` as a new usage record for an
    /// untracked process. Overload adds `overload_blocks` to a tracked
    /// process. When headroom is short, overload grants of queued processes
    /// are reclaimed oldest-first (same tier for spawn, same tier or lower for
    /// overload). The reclamation is planned first; if it cannot cover the
    /// request nothing is reclaimed and nothing is committed.
    ///
    /// Returns the number of blocks granted.
    ///
    /// # Errors
    /// - `ResourceAllocationError::Guarantee` / `Overload` on shortage
    /// - `AlreadyRegistered` for a spawn of a tracked process
    /// - `ProcessNotTracked` for an overload of an untracked process
    /// - `TierDirectory(UnknownTier)` if the tier has no budget
    pub fn allocate_blocks(
        &mut self,
        kind: AllocationKind,
        process_id: &ProcessId,
        tier: TierLevel,
        resources: &TierResources,
    ) -> OrchestratorResult<u32> {
        if tier
            .index()
            .and_then(|i| self.blocks_per_tier.get(i))
            .is_none()
        {
            return Err(TierDirectoryError::UnknownTier(tier).into());
        }

        let required = match kind {
            AllocationKind::Spawn => {
                if self.usage.contains_key(process_id) {
                    return Err(OrchestratorError::AlreadyRegistered(process_id.clone()));
                }
                resources.guaranteed_blocks
            }
            AllocationKind::Overload => {
                if !self.usage.contains_key(process_id) {
                    return Err(OrchestratorError::ProcessNotTracked(process_id.clone()));
                }
                resources.overload_blocks
            }
        };

        let (victims, available) = self.plan_preemption(kind, process_id, tier, required);
        if available < required {
            warn!(
                process_id = %process_id,
                tier = %tier,
                ?kind,
                required,
                available,
                "Insufficient blocks"
            );
            let err = match kind {
                AllocationKind::Spawn => ResourceAllocationError::Guarantee {
                    process_id: process_id.clone(),
                    tier,
                    required,
                    available,
                },
                AllocationKind::Overload => ResourceAllocationError::Overload {
                    process_id: process_id.clone(),
                    tier,
                    required,
                    available,
                },
            };
            return Err(err.into());
        }

        let mut outstanding = required.saturating_sub(self.headroom(kind, tier, &BTreeSet::new()));
        for victim in &victims {
            info!(
                victim = %victim,
                process_id = %process_id,
                "Preempting overload blocks"
            );
            outstanding = self.deallocate_overload_blocks(victim, outstanding)?;
        }

        match kind {
            AllocationKind::Spawn => {
                self.usage.insert(
                    process_id.clone(),
                    BlockUsage {
                        tier,
                        guaranteed: required,
                        overload: 0,
                    },
                );
            }
            AllocationKind::Overload => {
                let usage = self
                    .usage
                    .get_mut(process_id)
                    .ok_or_else(|| OrchestratorError::ProcessNotTracked(process_id.clone()))?;
                usage.overload = usage.overload.saturating_add(required);
                self.deallocation_queue.retain(|p| p != process_id);
            }
        }

        info!(
            process_id = %process_id,
            tier = %tier,
            ?kind,
            blocks = required,
            preempted = victims.len(),
            "Blocks allocated"
        );
        Ok(required)
    }

    /// Reserves ports and then guaranteed blocks for a new process.
    ///
    /// If the blocks cannot be granted the ports are returned before the
    /// error propagates.
    pub fn allocate_process(
        &mut self,
        process_id: &ProcessId,
        tier: TierLevel,
        resources: &TierResources,
    ) -> OrchestratorResult<ProcessAllocation> {
        if self.usage.contains_key(process_id) {
            return Err(OrchestratorError::AlreadyRegistered(process_id.clone()));
        }

        let ports = self.allocate_ports(resources.ports, process_id)?;
        match self.allocate_blocks(AllocationKind::Spawn, process_id, tier, resources) {
            Ok(guaranteed) => Ok(ProcessAllocation { ports, guaranteed }),
            Err(e) => {
                self.release_ports(process_id);
                Err(e)
            }
        }
    }

    /// Zeroes a process's overload blocks.
    ///
    /// Returns how much of `needed` is still uncovered after the release and
    /// queues an [`MonitorEvent::OverloadDeallocated`] notification.
    ///
    /// # Errors
    /// - `ProcessNotTracked` if the process holds no blocks
    pub fn deallocate_overload_blocks(
        &mut self,
        process_id: &ProcessId,
        needed: u32,
    ) -> OrchestratorResult<u32> {
        let usage = self
            .usage
            .get_mut(process_id)
            .ok_or_else(|| OrchestratorError::ProcessNotTracked(process_id.clone()))?;

        let released = std::mem::take(&mut usage.overload);
        self.deallocation_queue.retain(|p| p != process_id);
        self.events.push(MonitorEvent::OverloadDeallocated {
            process_id: process_id.clone(),
            released,
        });

        debug!(process_id = %process_id, released, needed, "Overload blocks released");
        Ok(needed.saturating_sub(released))
    }

    /// Marks a process's overload grant as reclaimable.
    ///
    /// # Errors
    /// - `ProcessNotTracked` if the process holds no blocks
    pub fn enqueue_for_deallocation(&mut self, process_id: &ProcessId) -> OrchestratorResult<()> {
        if !self.usage.contains_key(process_id) {
            return Err(OrchestratorError::ProcessNotTracked(process_id.clone()));
        }
        if !self.deallocation_queue.contains(process_id) {
            self.deallocation_queue.push_back(process_id.clone());
            debug!(process_id = %process_id, "Queued for overload reclamation");
        }
        Ok(())
    }

    /// Releases everything a process holds.
    ///
    /// # Errors
    /// - `ProcessNotTracked` if the process was never allocated
    pub fn process_exit_cleanup(&mut self, process_id: &ProcessId) -> OrchestratorResult<BlockUsage> {
        let usage = self
            .usage
            .remove(process_id)
            .ok_or_else(|| OrchestratorError::ProcessNotTracked(process_id.clone()))?;
        let ports = self.release_ports(process_id);
        self.deallocation_queue.retain(|p| p != process_id);

        info!(
            process_id = %process_id,
            guaranteed = usage.guaranteed,
            overload = usage.overload,
            ports,
            "Process resources released"
        );
        Ok(usage)
    }

    /// Whether `blocks` fit in the current headroom for `kind` at `tier`,
    /// without preempting anyone.
    pub fn can_allocate(&self, kind: AllocationKind, tier: TierLevel, blocks: u32) -> bool {
        self.headroom(kind, tier, &BTreeSet::new()) >= blocks
    }

    /// Drops every record. Used at manager teardown.
    pub fn clear(&mut self) {
        let processes: Vec<ProcessId> = self.usage.keys().cloned().collect();
        for process_id in processes {
            self.release_ports(&process_id);
        }
        self.usage.clear();
        self.deallocation_queue.clear();
        self.events.clear();
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            blocks_per_tier: self.blocks_per_tier.clone(),
            usage: self.usage.clone(),
            deallocation_queue: self.deallocation_queue.iter().cloned().collect(),
            free_ports: self.port_pool.len(),
            port_map: self.port_map.clone(),
        }
    }

    // ========================================================================
    // Headroom
    // ========================================================================

    fn budget(&self, tier: TierLevel) -> u32 {
        tier.index()
            .and_then(|i| self.blocks_per_tier.get(i))
            .copied()
            .unwrap_or(0)
    }

    /// Budget of `tier` and every lower-priority tier.
    fn shared_budget(&self, tier: TierLevel) -> u32 {
        tier.index()
            .and_then(|i| self.blocks_per_tier.get(i..))
            .map(|budgets| budgets.iter().sum())
            .unwrap_or(0)
    }

    /// Free blocks for `kind` at `tier`, as if the overload of every process
    /// in `reclaimed` were already released.
    fn headroom(&self, kind: AllocationKind, tier: TierLevel, reclaimed: &BTreeSet<&ProcessId>) -> u32 {
        let held = |process_id: &ProcessId, usage: &BlockUsage| {
            if reclaimed.contains(process_id) {
                usage.guaranteed
            } else {
                usage.total()
            }
        };

        let used_all: u32 = self.usage.iter().map(|(p, u)| held(p, u)).sum();
        let global_free = self.total_blocks().saturating_sub(used_all);

        let pool_free = match kind {
            AllocationKind::Spawn => {
                let occupancy: u32 = self
                    .usage
                    .iter()
                    .filter(|(_, u)| u.tier == tier)
                    .map(|(p, u)| held(p, u))
                    .sum();
                self.budget(tier).saturating_sub(occupancy)
            }
            AllocationKind::Overload => {
                let occupancy: u32 = self
                    .usage
                    .iter()
                    .filter(|(_, u)| tier.covers(u.tier))
                    .map(|(p, u)| held(p, u))
                    .sum();
                self.shared_budget(tier).saturating_sub(occupancy)
            }
        };

        pool_free.min(global_free)
    }

    /// Picks queued processes to reclaim, oldest first, until `required` fits.
    ///
    /// Returns the victims in queue order and the headroom once they are
    /// reclaimed.
    fn plan_preemption(
        &self,
        kind: AllocationKind,
        requester: &ProcessId,
        tier: TierLevel,
        required: u32,
    ) -> (Vec<ProcessId>, u32) {
        let mut reclaimed: BTreeSet<&ProcessId> = BTreeSet::new();
        let mut victims = Vec::new();
        let mut available = self.headroom(kind, tier, &reclaimed);

        for candidate in &self.deallocation_queue {
            if available >= required {
                break;
            }
            if candidate == requester {
                continue;
            }
            let Some(usage) = self.usage.get(candidate) else {
                continue;
            };
            let eligible = match kind {
                AllocationKind::Spawn => usage.tier == tier,
                AllocationKind::Overload => tier.covers(usage.tier),
            };
            if !eligible || usage.overload == 0 {
                continue;
            }

            reclaimed.insert(candidate);
            victims.push(candidate.clone());
            available = self.headroom(kind, tier, &reclaimed);
        }

        (victims, available)
    }
}
