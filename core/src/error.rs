//! Error types for the portbridge-core library.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::docker::errors::RuntimeError;

/// Result type alias for portbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing tunnels and daemon state.
#[derive(Error, Debug)]
pub enum Error {
    /// Environment or settings are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The container runtime could not be reached or its event feed broke.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A persisted state file exists but could not be understood.
    #[error("Corrupt state file {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    /// Daemon process management failed.
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
