//! Database layer for the Aria voice relay.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the system safety configuration accessors.
//! Every table in Aria is created through versioned migrations managed by
//! this crate.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: a single relay node owns its ledger — no
//!   external database process required. WAL allows concurrent readers with
//!   a single writer, which matches the admission-check-heavy access pattern.
//! - **`r2d2` connection pool**: bounded connection reuse without manual
//!   lifetime management. Async code reaches the pool through
//!   `tokio::task::spawn_blocking`.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so migrations ship with the server and cannot drift
//!   from the code that depends on them.

mod migrations;
mod pool;
mod safety;

pub use migrations::run_migrations;
pub use pool::{create_pool, DbPool, DbRuntimeSettings};
pub use safety::{load_active_config, seed_default_config, SafetyConfigError};
