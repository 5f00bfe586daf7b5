//! Error types for Meshbus
//!
//! Defines a comprehensive error enum covering all failure modes across the bus.
//! Uses thiserror for ergonomic error handling.

use crate::bus::{AddressError, FilenameError, FrontmatterError};
use crate::rearmatter::RearmatterError;
use thiserror::Error;

/// Result type alias for Meshbus operations
pub type Result<T> = std::result::Result<T, MeshBusError>;

/// Comprehensive error type for Meshbus operations
#[derive(Error, Debug)]
pub enum MeshBusError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (missing directories, write races)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message filename
    #[error("Filename error: {0}")]
    Filename(#[from] FilenameError),

    /// Malformed or unrepresentable frontmatter
    #[error("Frontmatter error: {0}")]
    Frontmatter(#[from] FrontmatterError),

    /// Agent identity parsing errors
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Rearmatter rejected in strict mode
    #[error("Rearmatter error: {0}")]
    Rearmatter(#[from] RearmatterError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File watcher errors
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Consumer lifecycle errors
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl From<tempfile::PersistError> for MeshBusError {
    fn from(err: tempfile::PersistError) -> Self {
        MeshBusError::Io(err.error)
    }
}

impl MeshBusError {
    /// True for errors that mean "this file is not a message" rather than a
    /// failure of the bus itself.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            MeshBusError::Filename(_) | MeshBusError::Frontmatter(_) | MeshBusError::Address(_)
        )
    }

    /// True when the underlying cause is a missing file or directory
    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshBusError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        let err: MeshBusError = FilenameError::MissingSeparator("x.md".to_string()).into();
        assert!(err.is_structural());

        let err = MeshBusError::Config("bad".to_string());
        assert!(!err.is_structural());
    }

    #[test]
    fn test_not_found_classification() {
        let err: MeshBusError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());

        let err: MeshBusError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(!err.is_not_found());
    }
}
