//! libSQL backend for the run status log.
//!
//! Supports local file and in-memory databases. Appends are serialized
//! through a writer lock so sequence numbers follow call order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::run::RunStatus;
use crate::store::migrations;
use crate::store::traits::{LogEntry, StatusLog};

/// libSQL-backed `StatusLog`.
pub struct LibSqlStatusLog {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    writer: Mutex<()>,
}

impl LibSqlStatusLog {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let log = Self::from_database(db)?;
        migrations::run_migrations(&log.conn).await?;
        info!(path = %path.display(), "Status log opened");
        Ok(log)
    }

    /// Create an in-memory log (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let log = Self::from_database(db)?;
        migrations::run_migrations(&log.conn).await?;
        Ok(log)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            writer: Mutex::new(()),
        })
    }

    /// Append an already encoded record.
    pub async fn append_payload(&self, query_id: &str, payload: &str) -> Result<u64, DatabaseError> {
        let _guard = self.writer.lock().await;
        self.conn
            .execute(
                "INSERT INTO task_run_log (query_id, payload) VALUES (?1, ?2)",
                params![query_id, payload],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append: {e}")))?;
        let seq = self.conn.last_insert_rowid() as u64;
        debug!(query_id = %query_id, seq, "Appended run status");
        Ok(seq)
    }

    /// Entries moved aside by `quarantine`, oldest first.
    pub async fn quarantined(&self) -> Result<Vec<LogEntry>, DatabaseError> {
        self.read_entries("SELECT seq, query_id, payload FROM task_run_quarantine ORDER BY seq ASC")
            .await
    }

    async fn read_entries(&self, sql: &str) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("read entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read entries: {e}")))?
        {
            let seq: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("read seq: {e}")))?;
            let query_id: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("read query_id: {e}")))?;
            let payload: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("read payload: {e}")))?;
            entries.push(LogEntry {
                seq: seq as u64,
                query_id,
                payload,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl StatusLog for LibSqlStatusLog {
    async fn append(&self, status: &RunStatus) -> Result<u64, DatabaseError> {
        let payload = status.encode()?;
        self.append_payload(status.query_id(), &payload).await
    }

    async fn replay(&self) -> Result<Vec<LogEntry>, DatabaseError> {
        self.read_entries("SELECT seq, query_id, payload FROM task_run_log ORDER BY seq ASC")
            .await
    }

    async fn quarantine(&self, seq: u64, reason: &str) -> Result<(), DatabaseError> {
        let _guard = self.writer.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("quarantine: {e}")))?;
        tx.execute(
            "INSERT OR REPLACE INTO task_run_quarantine (seq, query_id, payload, reason)
             SELECT seq, query_id, payload, ?2 FROM task_run_log WHERE seq = ?1",
            params![seq as i64, reason],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("quarantine: {e}")))?;
        tx.execute("DELETE FROM task_run_log WHERE seq = ?1", params![seq as i64])
            .await
            .map_err(|e| DatabaseError::Query(format!("quarantine: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("quarantine commit: {e}")))?;
        Ok(())
    }

    async fn purge(&self, query_ids: &[String]) -> Result<u64, DatabaseError> {
        if query_ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.writer.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("purge: {e}")))?;
        let mut removed = 0;
        for query_id in query_ids {
            removed += tx
                .execute(
                    "DELETE FROM task_run_log WHERE query_id = ?1",
                    params![query_id.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("purge: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("purge commit: {e}")))?;
        debug!(runs = query_ids.len(), rows = removed, "Purged run status records");
        Ok(removed)
    }
}
