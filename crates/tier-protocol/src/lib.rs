//! Tier Protocol - Wire protocol for the orchestrator control socket
//!
//! Clients (the `tierctl` binary, or an operator-facing service) talk to
//! `tierd` over a Unix socket using newline-delimited JSON. Every client
//! message carries a [`ProtocolVersion`]; the first message on a connection
//! must be `connect`.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};

/// Upper bound on a single encoded message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
