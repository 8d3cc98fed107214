//! Error types for configuration handling

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading or updating the core configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Time zone not known to the tz database
    #[error("Received invalid time zone {0}")]
    InvalidTimeZone(String),

    /// A path was requested before the config directory was known
    #[error("config_dir is not set")]
    NoConfigDir,

    #[error(transparent)]
    Storage(#[from] StorageError),
}
