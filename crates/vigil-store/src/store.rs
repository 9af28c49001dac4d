//! High-level transactional `AuditStore` API.
//!
//! Composes the repositories into atomic, task-centric methods. Every write
//! runs inside a single SQLite transaction — callers never observe partial
//! state.
//!
//! INVARIANT: task writes are serialized per-task via in-process mutex locks
//! (`with_task_write_lock`), so sequence assignment (`MAX + 1`) cannot race.
//! SQLite `UNIQUE(task_id, sequence)` enforces ordering at the DB level as a
//! second line of defense.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{debug, instrument};

use vigil_core::events::AuditEvent;
use vigil_core::finding::{Finding, FindingStatus};
use vigil_core::task::{AuditTask, Phase, ProgressCounters, SeverityCounts, TaskStatus};

use crate::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};
use crate::repositories::event::EventRepo;
use crate::repositories::finding::FindingRepo;
use crate::repositories::task::TaskRepo;

/// Durable store for tasks, events, and findings.
pub struct AuditStore {
    pool: ConnectionPool,
    global_write_lock: Mutex<()>,
    task_write_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl AuditStore {
    const SQLITE_BUSY_MAX_RETRIES: u32 = 32;

    /// Create a new store over a connection pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            global_write_lock: Mutex::new(()),
            task_write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    fn lock_global_write(&self) -> Result<MutexGuard<'_, ()>> {
        self.global_write_lock
            .lock()
            .map_err(|_| StoreError::Internal("global write lock poisoned".into()))
    }

    fn acquire_task_write_lock(&self, task_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .task_write_locks
            .lock()
            .map_err(|_| StoreError::Internal("task lock map poisoned".into()))?;

        // Opportunistically prune dead weak refs when the map grows.
        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(task_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let lock = Arc::new(Mutex::new(()));
        let _ = locks.insert(task_id.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    fn with_task_write_lock<T>(&self, task_id: &str, f: impl FnMut() -> Result<T>) -> Result<T> {
        let task_lock = self.acquire_task_write_lock(task_id)?;
        let _guard = task_lock
            .lock()
            .map_err(|_| StoreError::Internal("task write lock poisoned".into()))?;
        self.retry_on_sqlite_busy(f)
    }

    fn with_global_write_lock<T>(&self, f: impl FnMut() -> Result<T>) -> Result<T> {
        let _guard = self.lock_global_write()?;
        self.retry_on_sqlite_busy(f)
    }

    /// Retry an operation on SQLite BUSY/LOCKED with linear backoff + jitter.
    #[allow(clippy::unused_self)]
    fn retry_on_sqlite_busy<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempts = 0;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err)
                    if Self::is_sqlite_busy_or_locked(&err)
                        && attempts < Self::SQLITE_BUSY_MAX_RETRIES =>
                {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter_range = base_ms / 4;
                    let jitter = if jitter_range > 0 {
                        rand::random::<u64>() % (jitter_range * 2 + 1)
                    } else {
                        0
                    };
                    let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_sqlite_busy_or_locked(err: &StoreError) -> bool {
        match err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => {
                matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tasks
    // ─────────────────────────────────────────────────────────────────────

    /// Persist a new pending task.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub fn create_task(&self, task: &AuditTask) -> Result<()> {
        self.with_global_write_lock(|| {
            let conn = self.conn()?;
            TaskRepo::create(&conn, task)?;
            debug!(task_id = %task.id, "task created");
            Ok(())
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<AuditTask>> {
        let conn = self.conn()?;
        TaskRepo::get(&conn, task_id)
    }

    /// Transition a task's status, enforcing the absorbing-terminal graph.
    ///
    /// `started_at`/`ended_at` are stamped automatically. Returns the
    /// updated task. Fails with [`StoreError::IllegalTransition`] when the
    /// graph rejects the move — terminal statuses reject everything.
    #[instrument(skip(self), fields(task_id, next = next.as_str()))]
    pub fn transition(
        &self,
        task_id: &str,
        next: TaskStatus,
        error: Option<&str>,
    ) -> Result<AuditTask> {
        self.with_task_write_lock(task_id, || {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let current = TaskRepo::get_status(&tx, task_id)?
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            if !current.can_transition_to(next) {
                return Err(StoreError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from: current.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            let _ = TaskRepo::set_status(&tx, task_id, next, error)?;
            tx.commit()?;

            let conn = self.conn()?;
            TaskRepo::get(&conn, task_id)?
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
        })
    }

    /// Update the task's current phase.
    pub fn set_phase(&self, task_id: &str, phase: Option<Phase>) -> Result<bool> {
        self.with_task_write_lock(task_id, || {
            let conn = self.conn()?;
            TaskRepo::set_phase(&conn, task_id, phase)
        })
    }

    /// Overwrite the progress counter snapshot.
    pub fn set_progress(&self, task_id: &str, progress: &ProgressCounters) -> Result<bool> {
        self.with_task_write_lock(task_id, || {
            let conn = self.conn()?;
            TaskRepo::set_progress(&conn, task_id, progress)
        })
    }

    /// Record the completion rollup (severity counts + score).
    pub fn set_outcome(
        &self,
        task_id: &str,
        severity_counts: &SeverityCounts,
        score: f64,
    ) -> Result<bool> {
        self.with_task_write_lock(task_id, || {
            let conn = self.conn()?;
            TaskRepo::set_outcome(&conn, task_id, severity_counts, score)
        })
    }

    /// List task IDs with a given status.
    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<String>> {
        let conn = self.conn()?;
        TaskRepo::list_by_status(&conn, status)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    /// Append a persisted event, assigning the next sequence number.
    ///
    /// Atomic: sequence generation and insertion share one transaction, so
    /// a crash can never leave a gap. Ephemeral kinds are rejected — they
    /// must never reach durable storage.
    #[instrument(skip(self, event), fields(task_id = %event.task_id, kind = %event.kind))]
    pub fn append_event(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        if event.kind.is_ephemeral() {
            return Err(StoreError::InvalidOperation(format!(
                "ephemeral kind '{}' cannot be persisted",
                event.kind
            )));
        }
        let task_id = event.task_id.clone();
        self.with_task_write_lock(&task_id, || {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let _ = TaskRepo::get_status(&tx, &task_id)?
                .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;

            event.sequence = EventRepo::next_sequence(&tx, &task_id)?;
            EventRepo::insert(&tx, &event)?;
            tx.commit()?;
            metrics::counter!("store_events_appended_total").increment(1);
            Ok(event.clone())
        })
    }

    /// Events with `sequence > after_sequence`, ascending, up to `limit`.
    pub fn events_after(
        &self,
        task_id: &str,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        EventRepo::get_since(&conn, task_id, after_sequence, limit)
    }

    /// Latest persisted sequence for a task (0 when none).
    pub fn latest_sequence(&self, task_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        EventRepo::latest_sequence(&conn, task_id)
    }

    /// Whether a terminal event has been persisted for the task.
    pub fn has_terminal_event(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        EventRepo::has_terminal(&conn, task_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Findings
    // ─────────────────────────────────────────────────────────────────────

    /// Upsert a finding by fingerprint.
    ///
    /// First report inserts; re-reports merge (legal status transition,
    /// max confidence, upward severity) into the stored row. Returns the
    /// stored finding either way.
    #[instrument(skip(self, finding), fields(task_id = %finding.task_id, fingerprint = %finding.fingerprint))]
    pub fn upsert_finding(&self, finding: &Finding) -> Result<Finding> {
        let task_id = finding.task_id.clone();
        self.with_task_write_lock(&task_id, || {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let stored = match FindingRepo::get_by_fingerprint(&tx, &task_id, &finding.fingerprint)? {
                Some(mut existing) => {
                    existing.merge(finding);
                    let _ = FindingRepo::update(&tx, &existing)?;
                    existing
                }
                None => {
                    FindingRepo::insert(&tx, finding)?;
                    finding.clone()
                }
            };
            tx.commit()?;
            Ok(stored)
        })
    }

    /// All findings for a task.
    pub fn findings(&self, task_id: &str) -> Result<Vec<Finding>> {
        let conn = self.conn()?;
        FindingRepo::list_by_task(&conn, task_id)
    }

    /// Count findings with a given status.
    pub fn count_findings_by_status(&self, task_id: &str, status: FindingStatus) -> Result<i64> {
        let conn = self.conn()?;
        FindingRepo::count_by_status(&conn, task_id, status)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
