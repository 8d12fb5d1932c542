//! tierd - tiered compute orchestrator
//!
//! This crate provides the orchestration core:
//! - `monitor` - global ledger of tiered compute blocks and ports
//! - `daemon` - per-process actors owning containers, ports and timers
//! - `manager` - message queue, daemon registry and lifecycle handling
//! - `server` - Unix socket control surface
//! - `tiers` - Tier Directory seam
//! - `config` - file and environment configuration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          tierd                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────────┐    │
//! │  │  ControlServer  │────▶│        ManagerActor          │    │
//! │  │  (Unix socket)  │     │ queue, ResourceMonitor,      │    │
//! │  └─────────────────┘     │ daemon registry              │    │
//! │                          └───────┬──────────────▲───────┘    │
//! │                      commands    │              │ lifecycle  │
//! │                                  ▼              │ events     │
//! │                          ┌──────────────────────┴───────┐    │
//! │                          │  DaemonActor (per process)   │    │
//! │                          │  ContainerStack, PortTable   │    │
//! │                          └───────┬──────────────────────┘    │
//! │                                  │ ContainerRuntime          │
//! │                                  ▼                           │
//! │                             docker / mock                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod daemon;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod server;
pub mod tiers;

pub use error::{OrchestratorError, OrchestratorResult, ResourceAllocationError};
pub use manager::{spawn_manager, ManagerConfig, ManagerHandle};
