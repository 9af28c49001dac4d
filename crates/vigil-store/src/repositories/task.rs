//! Task repository — CRUD for the `tasks` table.
//!
//! Structured columns (status, phase, timestamps) are stored natively so
//! they can be filtered in SQL; the project/config/counter aggregates are
//! stored as JSON, parsed back into `vigil-core` types on read.

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use vigil_core::task::{AuditTask, Phase, ProgressCounters, SeverityCounts, TaskStatus};

use crate::errors::{Result, StoreError};

/// Task repository — stateless, every method takes `&Connection`.
pub struct TaskRepo;

impl TaskRepo {
    /// Insert a new task row.
    pub fn create(conn: &Connection, task: &AuditTask) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO tasks
             (id, project, status, phase, config, progress, severity_counts, score, error,
              created_at, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                serde_json::to_string(&task.project)?,
                task.status.as_str(),
                task.phase.map(Phase::as_str),
                serde_json::to_string(&task.config)?,
                serde_json::to_string(&task.progress)?,
                serde_json::to_string(&task.severity_counts)?,
                task.score,
                task.error,
                task.created_at,
                task.started_at,
                task.ended_at,
            ],
        )?;
        Ok(())
    }

    /// Get a task by ID.
    pub fn get(conn: &Connection, task_id: &str) -> Result<Option<AuditTask>> {
        conn.query_row(
            "SELECT id, project, status, phase, config, progress, severity_counts, score,
                    error, created_at, started_at, ended_at
             FROM tasks WHERE id = ?1",
            params![task_id],
            Self::map_row,
        )
        .optional()?
        .transpose()
    }

    /// Current status of a task.
    pub fn get_status(conn: &Connection, task_id: &str) -> Result<Option<TaskStatus>> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => Ok(Some(s.parse().map_err(StoreError::Internal)?)),
            None => Ok(None),
        }
    }

    /// Write a status (the caller has already validated the transition).
    /// Sets `started_at` on Running and `ended_at` + error on terminals.
    pub fn set_status(
        conn: &Connection,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = if status == TaskStatus::Running {
            conn.execute(
                "UPDATE tasks SET status = ?1, started_at = COALESCE(started_at, ?2) WHERE id = ?3",
                params![status.as_str(), now, task_id],
            )?
        } else if status.is_terminal() {
            conn.execute(
                "UPDATE tasks SET status = ?1, error = ?2, ended_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, now, task_id],
            )?
        } else {
            conn.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), task_id],
            )?
        };
        Ok(changed > 0)
    }

    /// Update the current phase.
    pub fn set_phase(conn: &Connection, task_id: &str, phase: Option<Phase>) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE tasks SET phase = ?1 WHERE id = ?2",
            params![phase.map(Phase::as_str), task_id],
        )?;
        Ok(changed > 0)
    }

    /// Overwrite the progress counter snapshot.
    pub fn set_progress(
        conn: &Connection,
        task_id: &str,
        progress: &ProgressCounters,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE tasks SET progress = ?1 WHERE id = ?2",
            params![serde_json::to_string(progress)?, task_id],
        )?;
        Ok(changed > 0)
    }

    /// Record the completion rollup.
    pub fn set_outcome(
        conn: &Connection,
        task_id: &str,
        severity_counts: &SeverityCounts,
        score: f64,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE tasks SET severity_counts = ?1, score = ?2 WHERE id = ?3",
            params![serde_json::to_string(severity_counts)?, score, task_id],
        )?;
        Ok(changed > 0)
    }

    /// List task IDs by status.
    pub fn list_by_status(conn: &Connection, status: TaskStatus) -> Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT id FROM tasks WHERE status = ?1 ORDER BY created_at")?;
        let ids = stmt
            .query_map(params![status.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Count total tasks.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<AuditTask>> {
        let project: String = row.get(1)?;
        let status: String = row.get(2)?;
        let phase: Option<String> = row.get(3)?;
        let config: String = row.get(4)?;
        let progress: String = row.get(5)?;
        let severity_counts: String = row.get(6)?;

        Ok(parse_task(TaskColumns {
            id: row.get(0)?,
            project,
            status,
            phase,
            config,
            progress,
            severity_counts,
            score: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            ended_at: row.get(11)?,
        }))
    }
}

struct TaskColumns {
    id: String,
    project: String,
    status: String,
    phase: Option<String>,
    config: String,
    progress: String,
    severity_counts: String,
    score: f64,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
}

fn parse_task(columns: TaskColumns) -> Result<AuditTask> {
    let phase = columns
        .phase
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(StoreError::Internal)?;
    Ok(AuditTask {
        id: columns.id,
        project: serde_json::from_str(&columns.project)?,
        status: columns.status.parse().map_err(StoreError::Internal)?,
        phase,
        config: serde_json::from_str(&columns.config)?,
        progress: parse_or_default(&columns.progress),
        severity_counts: parse_or_default(&columns.severity_counts),
        score: columns.score,
        error: columns.error,
        created_at: columns.created_at,
        started_at: columns.started_at,
        ended_at: columns.ended_at,
    })
}

fn parse_or_default<T: Default + serde::de::DeserializeOwned>(raw: &str) -> T {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
