//! Event repository — append and range reads for the `events` table.
//!
//! Sequence assignment happens in [`EventRepo::next_sequence`] and must run
//! inside the same transaction as the insert; the store's per-task write
//! lock serializes writers so `MAX(sequence) + 1` can never race.

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use vigil_core::events::{AuditEvent, EventKind};

use crate::errors::{Result, StoreError};

/// Event repository — stateless, every method takes `&Connection`.
pub struct EventRepo;

impl EventRepo {
    /// Next sequence number for a task (1 for the first event).
    pub fn next_sequence(conn: &Connection, task_id: &str) -> Result<i64> {
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(sequence) FROM events WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(max.unwrap_or(0) + 1)
    }

    /// Insert an event row. The sequence must already be assigned.
    pub fn insert(conn: &Connection, event: &AuditEvent) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO events (id, task_id, sequence, kind, phase, message, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id,
                event.task_id,
                event.sequence,
                event.kind.as_str(),
                event.phase.map(vigil_core::task::Phase::as_str),
                event.message,
                serde_json::to_string(&event.payload)?,
                event.timestamp,
            ],
        )?;
        Ok(())
    }

    /// Events with `sequence > after_sequence`, ascending, up to `limit`.
    pub fn get_since(
        conn: &Connection,
        task_id: &str,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let mut stmt = conn.prepare(
            "SELECT id, task_id, sequence, kind, phase, message, payload, timestamp
             FROM events WHERE task_id = ?1 AND sequence > ?2
             ORDER BY sequence ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![task_id, after_sequence, limit], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Latest persisted sequence for a task (0 when none).
    pub fn latest_sequence(conn: &Connection, task_id: &str) -> Result<i64> {
        Ok(Self::next_sequence(conn, task_id)? - 1)
    }

    /// Count events for a task.
    pub fn count(conn: &Connection, task_id: &str) -> Result<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Whether a terminal event has been persisted for the task.
    pub fn has_terminal(conn: &Connection, task_id: &str) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE task_id = ?1 AND kind = 'task.terminal')",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<AuditEvent>> {
        let kind: String = row.get(3)?;
        let phase: Option<String> = row.get(4)?;
        let payload: String = row.get(6)?;
        Ok(build_event(
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            kind,
            phase,
            row.get(5)?,
            payload,
            row.get(7)?,
        ))
    }
}

#[allow(clippy::too_many_arguments)]
fn build_event(
    id: String,
    task_id: String,
    sequence: i64,
    kind: String,
    phase: Option<String>,
    message: Option<String>,
    payload: String,
    timestamp: String,
) -> Result<AuditEvent> {
    let kind: EventKind = kind.parse().map_err(StoreError::Internal)?;
    let phase = phase
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(StoreError::Internal)?;
    let payload: Value = serde_json::from_str(&payload).unwrap_or_else(|e| {
        tracing::warn!(event_id = %id, error = %e, "corrupt event payload, defaulting to null");
        Value::Null
    });
    Ok(AuditEvent {
        id,
        task_id,
        sequence,
        kind,
        phase,
        message,
        payload,
        timestamp,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
