//! Connection pool creation and configuration.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

use crate::functions::register_functions;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// How long an unused pooled connection is kept open, in milliseconds.
    pub idle_timeout_ms: u64,

    /// How long to wait for a free connection before failing, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 10,
            idle_timeout_ms: 30_000,
            connection_timeout_ms: 30_000,
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
}

/// Creates a new SQLite connection pool with WAL mode and foreign keys enabled.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. `:memory:` works, but every
///   pooled connection then gets its own private database, so tests that use
///   more than one connection should point at a temporary file instead.
/// * `settings` - Pool sizing and timeout tunables.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the connection pool cannot be created.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory", which is acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))?;
            register_functions(conn)
        });

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .idle_timeout(Some(Duration::from_millis(settings.idle_timeout_ms)))
        .connection_timeout(Duration::from_millis(settings.connection_timeout_ms))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        max_size = settings.pool_max_size,
        "created database connection pool"
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_in_memory_pool() {
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
            ..DbRuntimeSettings::default()
        };

        let pool = create_pool(":memory:", settings).expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert!(
            mode == "wal" || mode == "memory",
            "unexpected journal_mode: {mode}"
        );

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match settings");

        assert_eq!(pool.max_size(), 3, "pool max size should match settings");

        let folded: String = conn
            .query_row("SELECT unicode_lower('ÉCOLE')", [], |row| row.get(0))
            .expect("pooled connections should carry unicode_lower");
        assert_eq!(folded, "école");
    }

    #[test]
    fn file_pool_uses_wal_journal() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("trails.db");
        let pool = create_pool(
            path.to_str().expect("temp path should be utf-8"),
            DbRuntimeSettings::default(),
        )
        .expect("pool creation should succeed");

        let conn = pool.get().expect("should get a connection");
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert_eq!(mode, "wal");
    }

    #[test]
    fn acquire_times_out_when_pool_is_exhausted() {
        let settings = DbRuntimeSettings {
            pool_max_size: 1,
            connection_timeout_ms: 50,
            ..DbRuntimeSettings::default()
        };
        let pool = create_pool(":memory:", settings).expect("pool creation should succeed");

        let _held = pool.get().expect("first connection should be available");
        assert!(
            pool.get().is_err(),
            "second acquire should fail once the timeout elapses"
        );
    }
}
