//! Error taxonomy for the orchestration core.
//!
//! Callers of the core only ever see [`OrchestratorError`]. Execution
//! failures are described by [`ExecutionError`] but are recorded on job
//! runs as data, never returned from `trigger_run`.

use thiserror::Error;

/// Errors returned by registry, admission and coordinator operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Malformed input: bad DAG, missing field, invalid parameter name
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown pipeline, job or run
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrency limit reached, duplicate name, or conflicting state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Raised by the authorization layer in front of the core
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl OrchestratorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Why a single job attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("job timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("{0}")]
    Adapter(String),

    #[error("executor panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// Whether this failure came from the per-job deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
