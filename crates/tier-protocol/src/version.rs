//! Protocol versioning for the control socket.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version of the control protocol, `major.minor`.
///
/// A major bump breaks the wire format; minor bumps only add message types
/// or optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a version string like "1.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }

    /// Same major version means compatible.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Checks a peer's version against [`ProtocolVersion::CURRENT`].
    pub fn check(&self) -> Result<(), VersionError> {
        if self.is_compatible_with(&Self::CURRENT) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: self.to_string(),
                expected: Self::CURRENT.to_string(),
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!(ProtocolVersion::parse("1.3").unwrap(), ProtocolVersion::new(1, 3));
        assert!(ProtocolVersion::parse("1").is_err());
        assert!(ProtocolVersion::parse("1.0.0").is_err());
        assert!(ProtocolVersion::parse("a.b").is_err());
    }

    #[test]
    fn test_version_check() {
        assert!(ProtocolVersion::new(1, 7).check().is_ok());
        assert!(matches!(
            ProtocolVersion::new(2, 0).check(),
            Err(VersionError::Incompatible { .. })
        ));
    }
}
