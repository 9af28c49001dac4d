//! Store error type.

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Connection pool exhausted or unavailable.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    /// Row payload failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// No task with the given ID.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// A status write violated the transition graph.
    #[error("illegal status transition for {task_id}: {from} -> {to}")]
    IllegalTransition {
        /// Task whose transition was rejected.
        task_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },
    /// The operation is not valid for this input.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Internal invariant violation.
    #[error("internal store error: {0}")]
    Internal(String),
}
