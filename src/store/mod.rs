//! Persistence layer — SQLite-backed storage for jobs, logs, results,
//! and checkpoints.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::StateStore;
