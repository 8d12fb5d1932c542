//! Control-surface message types.

use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use tier_core::{
    Container, ContainerId, HealthStatus, KillReport, MessageId, MessageIntent, MessageLookup,
    ProcessId, SystemSnapshot, TierLevel,
};

// ============================================================================
// Client -> Daemon
// ============================================================================

/// Requests a client can send to `tierd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; must be the first message on a connection.
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Queue a START or OVERLOAD request.
    Enqueue {
        intent: MessageIntent,
        /// Resolved from the Tier Directory when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tier: Option<TierLevel>,
        #[serde(default)]
        priority: u32,
    },

    /// Look up a queued or completed message.
    MessageStatus { id: MessageId },

    /// Build and run a container inside a process's daemon.
    InitializeContainer {
        process_id: ProcessId,
        container: Container,
    },

    HealthCheck {
        process_id: ProcessId,
        container_id: ContainerId,
    },

    /// Relay an opaque request body to a container and return its response.
    Forward {
        process_id: ProcessId,
        container_id: ContainerId,
        body: String,
    },

    /// Shut down a process's daemon.
    KillProcess { process_id: ProcessId },

    KillContainer {
        process_id: ProcessId,
        container_id: ContainerId,
    },

    /// Full system state.
    Snapshot,

    Ping { seq: u64 },

    Disconnect,
}

/// Envelope for everything a client sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn enqueue(intent: MessageIntent, tier: Option<TierLevel>, priority: u32) -> Self {
        Self::new(MessageType::Enqueue {
            intent,
            tier,
            priority,
        })
    }

    pub fn message_status(id: MessageId) -> Self {
        Self::new(MessageType::MessageStatus { id })
    }

    pub fn initialize_container(process_id: ProcessId, container: Container) -> Self {
        Self::new(MessageType::InitializeContainer {
            process_id,
            container,
        })
    }

    pub fn health_check(process_id: ProcessId, container_id: ContainerId) -> Self {
        Self::new(MessageType::HealthCheck {
            process_id,
            container_id,
        })
    }

    pub fn forward(process_id: ProcessId, container_id: ContainerId, body: String) -> Self {
        Self::new(MessageType::Forward {
            process_id,
            container_id,
            body,
        })
    }

    pub fn kill_process(process_id: ProcessId) -> Self {
        Self::new(MessageType::KillProcess { process_id })
    }

    pub fn kill_container(process_id: ProcessId, container_id: ContainerId) -> Self {
        Self::new(MessageType::KillContainer {
            process_id,
            container_id,
        })
    }

    pub fn snapshot() -> Self {
        Self::new(MessageType::Snapshot)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

// ============================================================================
// Daemon -> Client
// ============================================================================

/// Responses sent by `tierd`. Every request gets exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Handshake refused; the connection is closed afterwards.
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    Enqueued { id: MessageId },

    MessageStatus { id: MessageId, lookup: MessageLookup },

    ContainerInitialized {
        process_id: ProcessId,
        container_id: ContainerId,
        port: u16,
    },

    Health {
        container_id: ContainerId,
        status: HealthStatus,
    },

    Forwarded { body: String },

    /// Shutdown of the process's daemon has been requested.
    KillAccepted { process_id: ProcessId },

    ContainerKilled { report: KillReport },

    Snapshot { snapshot: Box<SystemSnapshot> },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// True when the same request may succeed later.
        #[serde(default)]
        retryable: bool,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn snapshot(snapshot: SystemSnapshot) -> Self {
        Self::Snapshot {
            snapshot: Box::new(snapshot),
        }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
            retryable: false,
        }
    }

    pub fn error_with_code(message: &str, code: &str, retryable: bool) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
            retryable,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Rejected { .. })
    }
}
