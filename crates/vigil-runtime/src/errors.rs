//! Runtime error taxonomy.
//!
//! Maps onto terminal task statuses at the controller boundary:
//!
//! - [`RuntimeError::Cancelled`] → `Cancelled` (a distinct, non-error outcome)
//! - everything else that escapes the phase machine → `Failed` with a
//!   truncated, safe message; full detail stays in internal logs.

use crate::workspace::AcquireError;

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures from the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Configuration rejected at submit; no task was created.
    #[error("invalid configuration: {0}")]
    Config(#[from] vigil_core::task::ConfigError),
    /// Workspace acquisition exhausted its fallback chain.
    #[error("workspace acquisition failed: {0}")]
    Acquire(#[from] AcquireError),
    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] vigil_store::StoreError),
    /// A phase worker failed without producing any artifact.
    #[error("worker failed: {0}")]
    Worker(String),
    /// The task's wall-clock budget elapsed.
    #[error("task timed out after {0}s")]
    Timeout(u64),
    /// Cancellation was requested and honored. Not an error.
    #[error("cancelled")]
    Cancelled,
    /// No task with the given ID.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Whether this outcome is the cooperative-cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
