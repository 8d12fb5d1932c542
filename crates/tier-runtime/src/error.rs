//! Runtime error type.

use thiserror::Error;

/// Failure reported by a container runtime call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// The runtime binary could not be spawned at all.
    #[error("failed to invoke {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The runtime ran but reported failure.
    #[error("{operation} failed for {target} (exit code {code:?}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        target: String,
        code: Option<i32>,
        stderr: String,
    },

    /// No running container exists for the tag.
    #[error("no running container for tag {0}")]
    NotRunning(String),
}

impl RuntimeError {
    pub fn command_failed(
        operation: &'static str,
        target: impl Into<String>,
        code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            operation,
            target: target.into(),
            code,
            stderr: stderr.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::command_failed("build", "42", Some(1), "no such file");
        assert_eq!(
            err.to_string(),
            "build failed for 42 (exit code Some(1)): no such file"
        );

        let err = RuntimeError::NotRunning("42".to_string());
        assert_eq!(err.to_string(), "no running container for tag 42");
    }
}
