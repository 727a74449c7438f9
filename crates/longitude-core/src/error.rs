//! Core error types for longitude-core.
//!
//! Only the mutating side of the library returns these. Derivations
//! (day math, display state) never fail; they fall back to sentinel or
//! degraded values instead. Transmission failures are not errors either:
//! they are reported through [`crate::sync::DrainOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for longitude-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A state mutation was attempted before `start()`.
    #[error("No active study: start the study before updating participant state")]
    NoActiveStudy,

    /// The task id is not part of the loaded study definition.
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    /// Key-value store failures. Always fatal to the calling operation.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Study definition could not be loaded or is inconsistent.
    #[error("Study definition error: {0}")]
    Definition(#[from] DefinitionError),
}

/// Key-value store errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading or writing the backing medium failed
    #[error("Failed to access '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Stored value is not valid JSON for the expected record
    #[error("Corrupt record under '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Record could not be serialized before writing
    #[error("Failed to serialize record for '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Backend-specific failure without an io::Error
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Study definition errors.
#[derive(Error, Debug)]
pub enum DefinitionError {
    /// Failed to read the definition file
    #[error("Failed to read study definition from {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the definition document
    #[error("Failed to parse study definition: {0}")]
    ParseFailed(String),

    /// File extension is neither `.json` nor `.toml`
    #[error("Unsupported study definition format: {0}")]
    UnsupportedFormat(PathBuf),

    /// Two tasks share the same id
    #[error("Duplicate task id '{0}'")]
    DuplicateTask(String),

    /// Invalid value for a study-level or task-level field
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// `skip_if.state_key` does not name a known state field
    #[error("Unknown state key '{0}'")]
    UnknownStateKey(String),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Failed to resolve the data directory
    #[error("Failed to resolve data directory: {0}")]
    DataDir(String),
}

impl From<toml::de::Error> for DefinitionError {
    fn from(err: toml::de::Error) -> Self {
        DefinitionError::ParseFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DefinitionError {
    fn from(err: serde_json::Error) -> Self {
        DefinitionError::ParseFailed(err.to_string())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_converts_into_core_error() {
        let err: CoreError = StorageError::Backend("disk full".into()).into();
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(err.to_string(), "Storage error: Storage backend failure: disk full");
    }

    #[test]
    fn test_no_active_study_message() {
        let err = CoreError::NoActiveStudy;
        assert!(err.to_string().starts_with("No active study"));
    }
}
