//! Cancellation token and result slot pairing a run with its submitter.

use tokio::sync::oneshot;
pub use tokio_util::sync::CancellationToken;

use crate::error::RunError;
use crate::run::status::RunStatus;

/// The run's side of the pair: the token it honors and the slot it fills.
#[derive(Debug)]
pub struct ExecutionHandle {
    query_id: String,
    token: CancellationToken,
    result_tx: Option<oneshot::Sender<RunStatus>>,
}

impl ExecutionHandle {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Publish the terminal status. Later calls are ignored.
    pub fn complete(&mut self, status: &RunStatus) {
        if let Some(tx) = self.result_tx.take() {
            // The submitter may have dropped its handle.
            let _ = tx.send(status.clone());
        }
    }
}

/// The submitter's side of the pair.
#[derive(Debug)]
pub struct RunHandle {
    query_id: String,
    token: CancellationToken,
    result_rx: oneshot::Receiver<RunStatus>,
}

impl RunHandle {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Request cancellation. A queued run fails without executing; a running
    /// run's job logic is abandoned and the run fails.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait for the run's terminal status.
    pub async fn wait(self) -> Result<RunStatus, RunError> {
        self.result_rx.await.map_err(|_| RunError::ResultDropped {
            query_id: self.query_id,
        })
    }
}

/// Create a connected execution/run handle pair.
pub fn handle_pair(query_id: impl Into<String>) -> (ExecutionHandle, RunHandle) {
    let query_id = query_id.into();
    let token = CancellationToken::new();
    let (result_tx, result_rx) = oneshot::channel();
    (
        ExecutionHandle {
            query_id: query_id.clone(),
            token: token.clone(),
            result_tx: Some(result_tx),
        },
        RunHandle {
            query_id,
            token,
            result_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::task::{JobKind, Task};

    #[tokio::test]
    async fn submitter_cancel_wakes_the_run() {
        let (exec, run) = handle_pair("q");
        let waiter = {
            let token = exec.token().clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!exec.token().is_cancelled());
        run.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.query_id(), "q");
    }

    #[tokio::test]
    async fn result_slot_delivers_status_once() {
        let task = Task::new(1, "t", "db", "SELECT 1", JobKind::Sql);
        let status = RunStatus::new("q", &task, 1, 1);
        let (mut exec, run) = handle_pair("q");
        exec.complete(&status);
        exec.complete(&RunStatus::new("other", &task, 2, 2));
        let received = run.wait().await.unwrap();
        assert_eq!(received.query_id(), "q");
    }

    #[tokio::test]
    async fn dropped_slot_is_reported() {
        let (exec, run) = handle_pair("q");
        drop(exec);
        assert!(matches!(
            run.wait().await,
            Err(RunError::ResultDropped { .. })
        ));
    }

    #[test]
    fn cancel_is_shared_between_sides() {
        let (exec, run) = handle_pair("q");
        run.cancel();
        assert!(exec.token().is_cancelled());
        assert!(run.is_cancelled());
    }
}
