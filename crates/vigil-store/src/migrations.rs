//! Schema migrations, tracked via `PRAGMA user_version`.
//!
//! Ordering invariants live in the schema itself: `UNIQUE(task_id, sequence)`
//! makes duplicate or out-of-order sequence writes a constraint violation,
//! and `UNIQUE(task_id, fingerprint)` makes finding duplication impossible
//! regardless of application bugs.

use rusqlite::Connection;
use tracing::info;

use crate::errors::Result;

const MIGRATIONS: &[&str] = &[
    // v1: tasks, events, findings
    "
    CREATE TABLE tasks (
        id              TEXT PRIMARY KEY,
        project         TEXT NOT NULL,
        status          TEXT NOT NULL,
        phase           TEXT,
        config          TEXT NOT NULL,
        progress        TEXT NOT NULL,
        severity_counts TEXT NOT NULL,
        score           REAL NOT NULL DEFAULT 0,
        error           TEXT,
        created_at      TEXT NOT NULL,
        started_at      TEXT,
        ended_at        TEXT
    );

    CREATE TABLE events (
        id        TEXT PRIMARY KEY,
        task_id   TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        sequence  INTEGER NOT NULL,
        kind      TEXT NOT NULL,
        phase     TEXT,
        message   TEXT,
        payload   TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        UNIQUE(task_id, sequence)
    );
    CREATE INDEX idx_events_task_sequence ON events(task_id, sequence);
    CREATE INDEX idx_events_task_kind ON events(task_id, kind);

    CREATE TABLE findings (
        id          TEXT PRIMARY KEY,
        task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        class       TEXT NOT NULL,
        severity    TEXT NOT NULL,
        file        TEXT NOT NULL,
        line        INTEGER,
        snippet     TEXT NOT NULL,
        status      TEXT NOT NULL,
        confidence  REAL NOT NULL,
        fingerprint TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        UNIQUE(task_id, fingerprint)
    );
    CREATE INDEX idx_findings_task ON findings(task_id);
    ",
];

/// Run all pending migrations. Idempotent.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let mut applied = 0;

    for (index, migration) in MIGRATIONS.iter().enumerate() {
        let version = u32::try_from(index).unwrap_or(u32::MAX) + 1;
        if version <= current {
            continue;
        }
        conn.execute_batch(migration)?;
        let _ = conn.execute_batch(&format!("PRAGMA user_version = {version}"))?;
        applied += 1;
        info!(version, "applied migration");
    }

    Ok(applied)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn migrations_apply_once() {
        let conn = setup();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(run_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn schema_has_expected_tables() {
        let conn = setup();
        let _ = run_migrations(&conn).unwrap();
        for table in ["tasks", "events", "findings"] {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }

    #[test]
    fn duplicate_sequence_rejected_at_db_level() {
        let conn = setup();
        let _ = run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, project, status, config, progress, severity_counts, created_at)
             VALUES ('task_1', '{}', 'pending', '{}', '{}', '{}', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO events (id, task_id, sequence, kind, payload, timestamp)
                      VALUES (?1, 'task_1', 1, 'log', '{}', '2026-01-01T00:00:00Z')";
        let _ = conn.execute(insert, ["evt_a"]).unwrap();
        assert!(conn.execute(insert, ["evt_b"]).is_err());
    }

    #[test]
    fn duplicate_fingerprint_rejected_at_db_level() {
        let conn = setup();
        let _ = run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, project, status, config, progress, severity_counts, created_at)
             VALUES ('task_1', '{}', 'pending', '{}', '{}', '{}', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO findings
                      (id, task_id, class, severity, file, line, snippet, status, confidence, fingerprint, created_at, updated_at)
                      VALUES (?1, 'task_1', 'injection', 'high', 'a.rs', 1, 'x', 'new', 0.5, 'fp_same', 't', 't')";
        let _ = conn.execute(insert, ["fnd_a"]).unwrap();
        assert!(conn.execute(insert, ["fnd_b"]).is_err());
    }

    #[test]
    fn deleting_task_cascades() {
        let conn = setup();
        let _ = run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, project, status, config, progress, severity_counts, created_at)
             VALUES ('task_1', '{}', 'pending', '{}', '{}', '{}', 't')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO events (id, task_id, sequence, kind, payload, timestamp)
             VALUES ('evt_1', 'task_1', 1, 'log', '{}', 't')",
            [],
        )
        .unwrap();
        let _ = conn.execute("DELETE FROM tasks WHERE id = 'task_1'", []).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
