//! SQLite connection pooling for the relay ledger.
//!
//! The relay's access pattern is read-heavy: every admission runs several
//! aggregation queries, while writes are small and serialized (session
//! rows, metric flushes). WAL fits that shape, so pool initialization
//! insists on it: the journal-mode pragma is verified rather than trusted,
//! and a connection that cannot enter WAL never joins the pool.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// The pooled SQLite handle shared across the workspace. Async callers
/// reach it through `tokio::task::spawn_blocking`.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection tunables, sourced from the `[database]` section of the
/// server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on a locked database before giving up,
    /// in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Errors from pool construction.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to build sqlite connection pool: {0}")]
    Build(#[from] r2d2::Error),
}

/// Applied to every connection as it enters the pool.
fn init_connection(conn: &Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    // In-memory databases report "memory"; anything else means SQLite
    // refused WAL and this deployment should not come up.
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("WAL journal mode refused, got: {journal_mode}")),
        ));
    }

    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

/// Opens (creating if needed) the ledger database at `db_path` and builds
/// the connection pool around it. `:memory:` works for tests, with the
/// caveat that each pooled connection sees its own database.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| init_connection(conn, settings.busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    Ok(pool)
}
