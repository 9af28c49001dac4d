//! Finding repository — fingerprint-keyed rows in the `findings` table.

use rusqlite::{Connection, OptionalExtension, params};

use vigil_core::finding::{Finding, FindingStatus, Location};
use vigil_core::task::VulnClass;

use crate::errors::{Result, StoreError};

/// Finding repository — stateless, every method takes `&Connection`.
pub struct FindingRepo;

impl FindingRepo {
    /// Insert a new finding row.
    pub fn insert(conn: &Connection, finding: &Finding) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO findings
             (id, task_id, class, severity, file, line, snippet, status, confidence,
              fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                finding.id,
                finding.task_id,
                finding.class.as_str(),
                finding.severity.as_str(),
                finding.location.file,
                finding.location.line,
                finding.snippet,
                finding.status.as_str(),
                finding.confidence,
                finding.fingerprint,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    /// Overwrite the mutable columns of an existing row (merge result).
    pub fn update(conn: &Connection, finding: &Finding) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE findings SET severity = ?1, status = ?2, confidence = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                finding.severity.as_str(),
                finding.status.as_str(),
                finding.confidence,
                now,
                finding.id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Look up a finding by task + fingerprint.
    pub fn get_by_fingerprint(
        conn: &Connection,
        task_id: &str,
        fingerprint: &str,
    ) -> Result<Option<Finding>> {
        conn.query_row(
            "SELECT id, task_id, class, severity, file, line, snippet, status, confidence, fingerprint
             FROM findings WHERE task_id = ?1 AND fingerprint = ?2",
            params![task_id, fingerprint],
            Self::map_row,
        )
        .optional()?
        .transpose()
    }

    /// All findings for a task, newest last.
    pub fn list_by_task(conn: &Connection, task_id: &str) -> Result<Vec<Finding>> {
        let mut stmt = conn.prepare(
            "SELECT id, task_id, class, severity, file, line, snippet, status, confidence, fingerprint
             FROM findings WHERE task_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![task_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Count findings for a task with a given status.
    pub fn count_by_status(
        conn: &Connection,
        task_id: &str,
        status: FindingStatus,
    ) -> Result<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM findings WHERE task_id = ?1 AND status = ?2",
            params![task_id, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Finding>> {
        let class: String = row.get(2)?;
        let severity: String = row.get(3)?;
        let status: String = row.get(7)?;
        Ok(build_finding(FindingColumns {
            id: row.get(0)?,
            task_id: row.get(1)?,
            class,
            severity,
            file: row.get(4)?,
            line: row.get(5)?,
            snippet: row.get(6)?,
            status,
            confidence: row.get(8)?,
            fingerprint: row.get(9)?,
        }))
    }
}

struct FindingColumns {
    id: String,
    task_id: String,
    class: String,
    severity: String,
    file: String,
    line: Option<u32>,
    snippet: String,
    status: String,
    confidence: f64,
    fingerprint: String,
}

fn build_finding(columns: FindingColumns) -> Result<Finding> {
    let class: VulnClass = serde_json::from_value(serde_json::Value::String(columns.class))
        .map_err(|e| StoreError::Internal(format!("unknown vuln class: {e}")))?;
    Ok(Finding {
        id: columns.id,
        task_id: columns.task_id,
        class,
        severity: columns.severity.parse().map_err(StoreError::Internal)?,
        location: Location {
            file: columns.file,
            line: columns.line,
        },
        snippet: columns.snippet,
        status: columns.status.parse().map_err(StoreError::Internal)?,
        confidence: columns.confidence,
        fingerprint: columns.fingerprint,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
