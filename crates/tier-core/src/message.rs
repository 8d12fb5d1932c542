//! Queued allocation requests and their status.

use crate::{MessageId, ProcessId, TierLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Intent
// ============================================================================

/// What a queued message asks the manager to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageIntent {
    /// Spawn a daemon for the process with its guaranteed blocks.
    Start { process_id: ProcessId },
    /// Grant the process's daemon its tier's overload blocks.
    Overload { process_id: ProcessId },
}

impl MessageIntent {
    pub fn process_id(&self) -> &ProcessId {
        match self {
            Self::Start { process_id } | Self::Overload { process_id } => process_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "START",
            Self::Overload { .. } => "OVERLOAD",
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    WaitingForResources,
    Success,
    Failed,
}

impl MessageStatus {
    /// Terminal statuses move a message from the queue to history.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::WaitingForResources => "WAITING_FOR_RESOURCES",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// An allocation request held by the manager's queue or history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub intent: MessageIntent,
    pub tier: TierLevel,
    /// Lower values run first within a tier.
    pub priority: u32,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reason recorded when the message failed or is waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Message {
    pub fn new(id: MessageId, intent: MessageIntent, tier: TierLevel, priority: u32) -> Self {
        Self {
            id,
            intent,
            tier,
            priority,
            status: MessageStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            detail: None,
        }
    }

    /// Queue ordering key: tier ascending, then priority ascending.
    pub fn order_key(&self) -> (TierLevel, u32) {
        (self.tier, self.priority)
    }

    /// Marks the message terminal.
    pub fn complete(&mut self, status: MessageStatus, detail: Option<String>) {
        self.status = status;
        self.detail = detail;
        self.completed_at = Some(Utc::now());
    }
}

/// Answer to a message status lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageLookup {
    /// Still in the live queue at `position` (0 = head).
    Queued {
        status: MessageStatus,
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Moved to history with a terminal status.
    Completed {
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    NotFound,
}

impl MessageLookup {
    pub fn status(&self) -> Option<MessageStatus> {
        match self {
            Self::Queued { status, .. } | Self::Completed { status, .. } => Some(*status),
            Self::NotFound => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_wire_format() {
        let intent = MessageIntent::Start {
            process_id: ProcessId::new("user1"),
        };
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["type"], "START");
        assert_eq!(json["process_id"], "user1");
        assert_eq!(intent.kind(), "START");
    }

    #[test]
    fn test_status_terminal() {
        assert!(!MessageStatus::Queued.is_terminal());
        assert!(!MessageStatus::WaitingForResources.is_terminal());
        assert!(MessageStatus::Success.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert_eq!(
            serde_json::to_string(&MessageStatus::WaitingForResources).unwrap(),
            "\"WAITING_FOR_RESOURCES\""
        );
    }

    #[test]
    fn test_complete_sets_timestamp() {
        let mut msg = Message::new(
            MessageId::new("m1"),
            MessageIntent::Overload {
                process_id: ProcessId::new("user2"),
            },
            TierLevel::new(2),
            5,
        );
        assert!(msg.completed_at.is_none());
        msg.complete(MessageStatus::Failed, Some("daemon not found".to_string()));
        assert_eq!(msg.status, MessageStatus::Failed);
        assert!(msg.completed_at.is_some());
        assert_eq!(msg.order_key(), (TierLevel::new(2), 5));
    }

    #[test]
    fn test_lookup_status() {
        let lookup = MessageLookup::Queued {
            status: MessageStatus::Queued,
            position: 3,
            detail: None,
        };
        assert_eq!(lookup.status(), Some(MessageStatus::Queued));
        assert_eq!(MessageLookup::NotFound.status(), None);
    }
}
