//! Manager actor commands.

use tokio::sync::oneshot;

use tier_core::{Message, MessageId, MessageIntent, MessageLookup, MonitorSnapshot, ProcessId, TierLevel};

use crate::daemon::DaemonHandle;
use crate::error::OrchestratorResult;

/// Commands processed sequentially by the [`super::ManagerActor`].
///
/// Container-level work (init, health, forward, single kills) does not go
/// through the manager loop: the handle fetches the daemon with
/// [`ManagerCommand::GetDaemon`] and talks to it directly.
#[derive(Debug)]
pub enum ManagerCommand {
    /// Insert an allocation request into the queue.
    ///
    /// `tier` is resolved from the Tier Directory when absent.
    Enqueue {
        intent: MessageIntent,
        tier: Option<TierLevel>,
        priority: u32,
        respond_to: oneshot::Sender<OrchestratorResult<MessageId>>,
    },

    MessageStatus {
        id: MessageId,
        respond_to: oneshot::Sender<MessageLookup>,
    },

    /// Advance the head of the queue by one step.
    ///
    /// Answered with the head message as it stands after processing.
    Tick {
        respond_to: Option<oneshot::Sender<Option<Message>>>,
    },

    GetDaemon {
        process_id: ProcessId,
        respond_to: oneshot::Sender<OrchestratorResult<DaemonHandle>>,
    },

    /// Ask a daemon to shut down. Cleanup happens when it reports `Exited`.
    KillProcess {
        process_id: ProcessId,
        respond_to: oneshot::Sender<OrchestratorResult<()>>,
    },

    Snapshot {
        respond_to: oneshot::Sender<LedgerView>,
    },

    /// Shut down every daemon, clear the ledger and stop the actor.
    Shutdown {
        respond_to: oneshot::Sender<Vec<(ProcessId, i32)>>,
    },
}

/// Manager-side state needed to assemble a [`tier_core::SystemSnapshot`].
///
/// Daemon snapshots are collected by the caller so the manager loop never
/// waits on a daemon for a read.
#[derive(Debug, Clone)]
pub struct LedgerView {
    pub daemons: Vec<DaemonHandle>,
    pub queue: Vec<Message>,
    pub monitor: MonitorSnapshot,
}
