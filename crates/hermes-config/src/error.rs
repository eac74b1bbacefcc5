//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
///
/// Every variant maps to the `CONFIG_INVALID` error kind: configuration
/// problems are startup-fatal and the process exits with code 1.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration
    #[error("failed to parse config file '{path}': {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Configuration file not found
    #[error("config file '{path}' not found")]
    NotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// A source descriptor is missing a required field
    #[error("source '{source_name}' is missing required field '{field}'")]
    SourceIncomplete { source_name: String, field: String },

    /// Two sources share the same name
    #[error("duplicate source name '{0}'")]
    DuplicateSource(String),

    /// Configuration validation error
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    /// Create a new ReadFile error.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// Create a new ParseYaml error.
    pub fn parse_yaml(path: impl Into<PathBuf>, source: serde_yaml::Error) -> Self {
        Self::ParseYaml {
            path: path.into(),
            source,
        }
    }

    /// Create a new InvalidValue error.
    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a new SourceIncomplete error.
    pub fn source_incomplete(source: impl Into<String>, field: impl Into<String>) -> Self {
        Self::SourceIncomplete {
            source_name: source.into(),
            field: field.into(),
        }
    }

    /// Stable error kind string used by the HTTP error body.
    pub fn kind(&self) -> &'static str {
        "CONFIG_INVALID"
    }
}
