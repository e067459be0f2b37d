//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for configuration lookups.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading, addressing or validating a [`Config`](crate::Config).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The YAML document (or an override value) does not parse.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An action was requested whose required keys are absent.
    #[error("action {action:?} requires missing config keys: {}", .keys.join(", "))]
    MissingKeys { action: String, keys: Vec<String> },

    /// A dotted path runs through a node that is not a mapping.
    #[error("key path {path:?} stops at {key:?}, which is not key-addressable")]
    NotAddressable { path: String, key: String },

    /// A value is present but has the wrong type or an out-of-range value.
    #[error("invalid value for {key:?}: {message}")]
    InvalidValue { key: String, message: String },
}
