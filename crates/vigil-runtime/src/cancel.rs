//! Per-task cooperative cancellation registry.
//!
//! Cancellation is looked up by task id, never held by reference, so every
//! concurrent unit touching a task observes the same flag. Requests are
//! sticky: once a task id is cancelled it can never be un-cancelled, and a
//! request arriving before the task registers is remembered and honored at
//! the first safe point after pickup.
//!
//! Lifecycle: `register` on submit, `remove` on terminal cleanup.

use dashmap::DashMap;
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Process-wide registry of per-task cancellation tokens.
pub struct CancelRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    /// Register a task, returning its token. Idempotent: a token created
    /// earlier by a pre-start [`request`](Self::request) is returned as-is,
    /// cancelled state included.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = self
            .tokens
            .entry(task_id.to_string())
            .or_default()
            .clone();
        gauge!("cancel_tokens_registered").set(self.tokens.len() as f64);
        token
    }

    /// Request cancellation for a task id.
    ///
    /// Safe at any point: before registration (the request is remembered),
    /// during execution, or repeatedly (a no-op after the first call).
    pub fn request(&self, task_id: &str) {
        let token = self.tokens.entry(task_id.to_string()).or_default();
        if !token.is_cancelled() {
            warn!(task_id, "cancellation requested");
        }
        token.cancel();
    }

    /// Whether cancellation has been requested for a task id.
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.tokens
            .get(task_id)
            .is_some_and(|token| token.is_cancelled())
    }

    /// Look up the token for a task id without creating one.
    pub fn get(&self, task_id: &str) -> Option<CancellationToken> {
        self.tokens.get(task_id).map(|token| token.value().clone())
    }

    /// Drop the registry entry on terminal cleanup.
    pub fn remove(&self, task_id: &str) {
        if self.tokens.remove(task_id).is_some() {
            debug!(task_id, "cancel token released");
        }
        gauge!("cancel_tokens_registered").set(self.tokens.len() as f64);
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
