//! Error types for shipd

use thiserror::Error;

/// Main error type for shipd
#[derive(Error, Debug)]
pub enum ShipError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Remote command failed: {0}")]
    RemoteCommand(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShipError {
    /// Whether the error stems from a caller asking for something unknown
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShipError::NotFound(_))
    }
}
