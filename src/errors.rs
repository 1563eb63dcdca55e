// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CellRunnerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Bridge script not found: {0:?}")]
    ScriptNotFound(PathBuf),

    #[error("Failed to spawn kernel bridge: {0}")]
    SpawnFailed(String),

    #[error("Not connected to a kernel")]
    NotConnected,

    #[error("Kernel connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Runtime is no longer running")]
    RuntimeStopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CellRunnerError {
    /// Transport-class errors are fatal to the current connection only.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CellRunnerError::ExecutableNotFound(_)
                | CellRunnerError::ScriptNotFound(_)
                | CellRunnerError::SpawnFailed(_)
                | CellRunnerError::ConnectionFailed(_)
                | CellRunnerError::NotConnected
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CellRunnerError>;
