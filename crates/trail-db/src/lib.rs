//! Database layer for the trail audit store.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and the embedded migrations that create the `trails` table. The manager
//! in `trail-core` only ever talks to the database through a [`DbPool`]
//! built here or supplied by the caller.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer; all
//!   isolation and locking below the SQL boundary is left to SQLite.
//! - **`r2d2` connection pool**: bounded connection reuse, with acquire and
//!   idle timeouts taken from [`DbRuntimeSettings`].
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` so the schema cannot drift from the queries using it.

mod functions;
mod migrations;
mod pool;

pub use functions::{register_functions, UNICODE_LOWER};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
