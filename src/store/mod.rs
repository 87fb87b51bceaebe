//! Persistence layer: the durable run status log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStatusLog;
pub use traits::{LogEntry, StatusLog};
