//! `StatusLog` trait: the durable, append-only home of run status records.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::run::RunStatus;

/// One raw record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Write order. Later records for the same query id supersede earlier ones.
    pub seq: u64,
    pub query_id: String,
    /// The encoded record, undecoded so corrupt entries can be reported.
    pub payload: String,
}

/// Append-only log of run status records.
///
/// Appends are totally ordered; replay returns entries in that order.
#[async_trait]
pub trait StatusLog: Send + Sync {
    /// Encode and append `status`. Returns the assigned sequence number.
    async fn append(&self, status: &RunStatus) -> Result<u64, DatabaseError>;

    /// All entries in append order.
    async fn replay(&self) -> Result<Vec<LogEntry>, DatabaseError>;

    /// Move the entry at `seq` out of the log, keeping it with `reason`.
    async fn quarantine(&self, seq: u64, reason: &str) -> Result<(), DatabaseError>;

    /// Drop every entry for the given query ids. Returns rows removed.
    async fn purge(&self, query_ids: &[String]) -> Result<u64, DatabaseError>;
}
