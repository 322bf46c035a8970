//! Error types for the warden service supervisor.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, activating or supervising services.
#[derive(Error, Debug)]
pub enum Error {
    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A service with the same name was already loaded
    #[error("Service already exists: {0}")]
    DuplicateService(String),

    /// A configuration group could not be turned into a service definition
    #[error("Invalid service group [{group}]: {reason}")]
    InvalidGroup { group: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Configuration file could not be read or parsed
    #[error("Invalid configuration file: {path}: {reason}")]
    InvalidConfigFile { path: PathBuf, reason: String },

    /// Socket activation error
    #[error("Socket activation error for {name}: {reason}")]
    SocketActivationError { name: String, reason: String },

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Run-as identity could not be resolved
    #[error("Unknown {kind}: {name}")]
    UnknownIdentity { kind: &'static str, name: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Build an `InvalidGroup` error.
    pub(crate) fn invalid_group(group: &str, reason: impl Into<String>) -> Self {
        Error::InvalidGroup {
            group: group.to_string(),
            reason: reason.into(),
        }
    }
}
