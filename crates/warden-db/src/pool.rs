//! The SQLite pool the event store runs on.
//!
//! Every connection sees the same database file in WAL mode, so readers
//! never block the single writer. A push holds one connection for the
//! length of its `IMMEDIATE` transaction; a filter stream holds one until
//! it is drained or dropped. `pool_max_size` therefore bounds the number of
//! concurrent pushes plus open streams, and a checkout that waits longer
//! than `connection_timeout_ms` surfaces as a transient failure.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

const IN_MEMORY: &str = ":memory:";

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits for the writer lock before SQLite
    /// reports `SQLITE_BUSY`, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// How long a checkout waits for a free connection, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            connection_timeout_ms: 10_000,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),

    /// The settings cannot give every connection the same event log.
    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),
}

impl DbRuntimeSettings {
    fn validate(&self, db_path: &str) -> Result<(), PoolError> {
        if self.pool_max_size == 0 {
            return Err(PoolError::InvalidSettings("pool_max_size must be positive".into()));
        }
        if self.connection_timeout_ms == 0 {
            return Err(PoolError::InvalidSettings(
                "connection_timeout_ms must be positive".into(),
            ));
        }
        // Each `:memory:` connection opens a private database.
        if db_path == IN_MEMORY && self.pool_max_size > 1 {
            return Err(PoolError::InvalidSettings(
                "an in-memory database needs pool_max_size = 1".into(),
            ));
        }
        Ok(())
    }
}

/// Applies the pragmas every event-store connection relies on.
fn init_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    // In-memory databases report "memory", which is acceptable.
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("failed to set WAL journal mode, got: {journal_mode}")),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

/// Creates the pool an event store runs on.
///
/// # Errors
///
/// Returns `PoolError::InvalidSettings` for a zero pool size or timeout, or
/// for a multi-connection `:memory:` pool, and `PoolError::PoolInit` if the
/// connections cannot be opened.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    settings.validate(db_path)?;

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| init_connection(conn, busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .connection_timeout(Duration::from_millis(settings.connection_timeout_ms))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        pool_max_size = settings.pool_max_size,
        busy_timeout_ms,
        connection_timeout_ms = settings.connection_timeout_ms,
        "created sqlite pool"
    );

    Ok(pool)
}
