//! Tier Core - Shared domain types for the tiered orchestrator
//!
//! This crate provides the value types shared between the orchestrator
//! (`tierd`), the container runtime adapters and the control client.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod container;
pub mod error;
pub mod health;
pub mod ids;
pub mod message;
pub mod ports;
pub mod snapshot;
pub mod tier;

// Re-exports for convenience
pub use container::{Container, ContainerStack, StackUsage};
pub use error::{DomainError, DomainResult};
pub use health::HealthStatus;
pub use ids::{ContainerId, MessageId, ProcessId};
pub use message::{Message, MessageIntent, MessageLookup, MessageStatus};
pub use ports::PortTable;
pub use snapshot::{
    BlockUsage, ContainerView, DaemonSnapshot, DaemonState, KillFailure, KillReport,
    MonitorSnapshot, SystemSnapshot,
};
pub use tier::{Tier, TierLevel, TierResources};
