//! Container health states reported by the container runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a running container as reported by its health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Starting,
    Unhealthy,
}

impl HealthStatus {
    /// Parses a runtime health string.
    ///
    /// Quotes and whitespace are stripped. Anything that is not `healthy` or
    /// `starting` (including an empty status for images without a health
    /// check) counts as unhealthy.
    pub fn parse_runtime_output(raw: &str) -> Self {
        match raw.trim().trim_matches('"') {
            "healthy" => Self::Healthy,
            "starting" => Self::Starting,
            _ => Self::Unhealthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Starting => "starting",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
