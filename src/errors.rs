// src/errors.rs

//! Crate-wide error types.
//!
//! Job-level failures (handler errors, timeouts, resource violations) are not
//! errors at this level: they are recorded as failed [`JobResult`]s with an
//! [`ErrorCategory`]. Only problems that abort an `execute()` call, or that a
//! caller must react to (lock contention), surface as [`EngineError`].
//!
//! [`JobResult`]: crate::types::JobResult
//! [`ErrorCategory`]: crate::types::ErrorCategory

use thiserror::Error;

/// Failures of the shared key-value backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compare-and-swap retries were exhausted on a hot key.
    #[error("Too many concurrent writers on key '{0}'")]
    Contention(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cycle detected in job graph: {0}")]
    DagCycle(String),

    #[error("Lock on '{0}' is held by another owner")]
    LockContention(String),

    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error rejected a job graph before anything ran.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::DagCycle(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, EngineError>;
pub type BackendResult<T> = std::result::Result<T, BackendError>;
