//! Per-entity persistence.
//!
//! Each submodule owns the SQL for one table family. Single-statement
//! functions accept any [`sqlx::SqliteExecutor`] (a pool or a connection);
//! functions that issue several statements take `&mut SqliteConnection` so
//! they can run inside [`crate::db::with_transaction`].

pub mod branches;
pub mod codebases;
pub mod commits;
pub mod cursors;
pub mod developers;
pub mod tree;
pub mod worklogs;

/// Current time as Unix seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
