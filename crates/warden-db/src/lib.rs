//! Database layer for the Warden event store.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and the embedded schema migrations for the event log, the unique-constraint
//! ledger, the search-field index and the exclusive-task lock table.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: readers never block the writer and the writer
//!   never blocks readers. There is exactly one writer at a time, which is
//!   what the append pipeline's atomic unit relies on.
//! - **`r2d2` connection pool**: bounded connection reuse shared by the
//!   blocking tasks the async store spawns.
//! - **Embedded migrations**: SQL files are compiled in via `include_str!`,
//!   so the schema cannot drift from the code that depends on it.

mod migrations;
mod pool;

pub use migrations::{migration_names, run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
