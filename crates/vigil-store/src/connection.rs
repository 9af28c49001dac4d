//! SQLite connection pooling.
//!
//! Every pool connection runs the same pragma set on checkout init:
//! WAL journaling, foreign keys on, and a busy timeout so concurrent
//! writers back off inside SQLite before our own retry loop engages.

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use uuid::Uuid;

use crate::errors::Result;

/// Pooled connection type alias.
pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;
/// Single checked-out connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool sizing and timeout configuration.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum pooled connections.
    pub max_size: u32,
    /// SQLite busy timeout per connection (ms).
    pub busy_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

fn init_pragmas(busy_timeout_ms: u64) -> impl Fn(&mut rusqlite::Connection) -> rusqlite::Result<()> {
    move |conn| {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};
             PRAGMA synchronous = NORMAL;"
        ))
    }
}

/// Open a file-backed pool.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    let manager =
        SqliteConnectionManager::file(path).with_init(init_pragmas(config.busy_timeout_ms));
    build(manager, config)
}

/// Open a process-private in-memory pool.
///
/// Uses a uniquely named shared-cache memory database so every pooled
/// connection sees the same data. The pool keeps an idle connection alive,
/// which keeps the database alive.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    let name = format!(
        "file:vigil_{}?mode=memory&cache=shared",
        Uuid::now_v7().simple()
    );
    let manager = SqliteConnectionManager::file(name)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_init(init_pragmas(config.busy_timeout_ms));
    build(manager, config)
}

fn build(manager: SqliteConnectionManager, config: &ConnectionConfig) -> Result<ConnectionPool> {
    let pool = r2d2::Pool::builder()
        .max_size(config.max_size)
        .min_idle(Some(1))
        .build(manager)?;
    Ok(pool)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
