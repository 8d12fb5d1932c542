//! Type-safe identifiers.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::num::ParseIntError;
use std::str::FromStr;

// ============================================================================
// Process Identifier
// ============================================================================

/// Identifier of a tenant process (one daemon per process).
///
/// The Tier Directory maps process identifiers to service tiers, so this is
/// usually the tenant's user name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    /// Creates a new ProcessId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProcessId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ProcessId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Container Identifier
// ============================================================================

/// Identifier of a container inside a daemon.
///
/// Container identifiers are integers: the port table hashes them with
/// `id mod |ports|`, and the same value doubles as the image tag handed to
/// the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(u64);

impl ContainerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Image/container tag used with the container runtime.
    ///
    /// Tags are scoped to the owning process, so two daemons can each run a
    /// container with the same id. Bytes of the process id outside `[a-z0-9]`
    /// are written as `_xx` (hex); the result is a valid lowercase image name
    /// and distinct owners never share a tag.
    pub fn tag(self, owner: &ProcessId) -> String {
        let mut tag = String::with_capacity(owner.as_str().len() + 8);
        tag.push('p');
        for byte in owner.as_str().bytes() {
            if byte.is_ascii_lowercase() || byte.is_ascii_digit() {
                tag.push(char::from(byte));
            } else {
                let _ = write!(tag, "_{byte:02x}");
            }
        }
        let _ = write!(tag, "-{}", self.0);
        tag
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContainerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for ContainerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

// ============================================================================
// Message Identifier
// ============================================================================

/// Identifier of a queued allocation message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
