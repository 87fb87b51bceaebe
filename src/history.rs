//! Run history: the latest known status of every run, backed by the durable
//! status log.
//!
//! On startup `recover` replays the log. The last record per query id wins
//! unless it would move the run backwards; such records and records that fail
//! to decode are quarantined. Runs that were still `PENDING` or `RUNNING` when
//! the process stopped are failed as interrupted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::run::RunStatus;
use crate::run::state::ERR_INTERRUPTED;
use crate::store::StatusLog;

/// What `recover` found in the log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Distinct runs restored.
    pub recovered: usize,
    /// Runs that were in flight and are now failed.
    pub interrupted: Vec<String>,
    /// Sequence numbers of records that could not be decoded or applied.
    pub quarantined: Vec<u64>,
}

pub struct RunHistory {
    log: Arc<dyn StatusLog>,
    runs: RwLock<HashMap<String, RunStatus>>,
}

impl RunHistory {
    pub fn new(log: Arc<dyn StatusLog>) -> Self {
        Self {
            log,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<dyn StatusLog> {
        &self.log
    }

    /// Rebuild history from the status log.
    pub async fn recover(&self) -> Result<RecoveryReport, DatabaseError> {
        let entries = self.log.replay().await?;
        let mut report = RecoveryReport::default();
        let mut latest: HashMap<String, RunStatus> = HashMap::new();

        for entry in entries {
            let status = match RunStatus::decode(entry.payload.as_bytes()) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(
                        seq = entry.seq,
                        query_id = %entry.query_id,
                        error = %e,
                        "Quarantining undecodable run status record"
                    );
                    self.log.quarantine(entry.seq, &e.to_string()).await?;
                    report.quarantined.push(entry.seq);
                    continue;
                }
            };
            if let Some(current) = latest.get(status.query_id())
                && !current.state().accepts_update(status.state())
            {
                let reason = format!("{} record after {}", status.state(), current.state());
                tracing::warn!(
                    seq = entry.seq,
                    query_id = %status.query_id(),
                    reason = %reason,
                    "Quarantining stale run status record"
                );
                self.log.quarantine(entry.seq, &reason).await?;
                report.quarantined.push(entry.seq);
                continue;
            }
            latest.insert(status.query_id().to_string(), status);
        }

        let now = Utc::now().timestamp_millis();
        for status in latest.values_mut() {
            if status.state().is_terminal() {
                continue;
            }
            let previous = status.state();
            if let Err(e) = status.mark_failed(
                ERR_INTERRUPTED,
                format!("run was {previous} when the scheduler stopped"),
                now,
            ) {
                tracing::warn!(query_id = %status.query_id(), error = %e, "Could not fail interrupted run");
                continue;
            }
            self.log.append(status).await?;
            report.interrupted.push(status.query_id().to_string());
        }

        report.recovered = latest.len();
        report.interrupted.sort();
        *self.runs.write().await = latest;

        tracing::info!(
            recovered = report.recovered,
            interrupted = report.interrupted.len(),
            quarantined = report.quarantined.len(),
            "Run history recovered"
        );
        Ok(report)
    }

    /// Persist a status transition and remember it. A record that would move
    /// a known run backwards, or follow its terminal record, is refused.
    pub async fn record(&self, status: &RunStatus) -> Result<u64, DatabaseError> {
        let mut runs = self.runs.write().await;
        if let Some(current) = runs.get(status.query_id())
            && !current.state().accepts_update(status.state())
        {
            return Err(DatabaseError::StaleRecord {
                query_id: status.query_id().to_string(),
                current: current.state().to_string(),
                incoming: status.state().to_string(),
            });
        }
        let seq = self.log.append(status).await?;
        runs.insert(status.query_id().to_string(), status.clone());
        Ok(seq)
    }

    pub async fn get(&self, query_id: &str) -> Option<RunStatus> {
        self.runs.read().await.get(query_id).cloned()
    }

    /// All known runs, newest first.
    pub async fn list(&self) -> Vec<RunStatus> {
        let mut runs: Vec<RunStatus> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| {
            b.create_time()
                .cmp(&a.create_time())
                .then_with(|| a.query_id().cmp(b.query_id()))
        });
        runs
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    /// Forget finished runs whose retention has lapsed, in memory and in the
    /// log. Runs still in flight are kept regardless of their expire time.
    pub async fn remove_expired(&self, now_millis: i64) -> Result<Vec<String>, DatabaseError> {
        let expired: Vec<String> = self
            .runs
            .read()
            .await
            .values()
            .filter(|s| s.state().is_terminal() && s.is_expired(now_millis))
            .map(|s| s.query_id().to_string())
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        self.log.purge(&expired).await?;
        let mut runs = self.runs.write().await;
        for query_id in &expired {
            runs.remove(query_id);
        }
        tracing::info!(count = expired.len(), "Removed expired task runs");
        Ok(expired)
    }
}

/// Spawn a background task that periodically drops expired runs.
pub fn spawn_retention_sweep(
    history: Arc<RunHistory>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = history.remove_expired(Utc::now().timestamp_millis()).await {
                tracing::warn!(error = %e, "Retention sweep failed");
            }
        }
    })
}
