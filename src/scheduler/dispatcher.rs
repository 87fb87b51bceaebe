//! Worker pool that drains the run queue.
//!
//! Each worker claims one run at a time, executes it in its own task so that a
//! panicking processor only fails that run, and records every state change in
//! the run history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{QueueError, RunError};
use crate::history::RunHistory;
use crate::processor::ProcessorRegistry;
use crate::run::state::{ERR_PROCESSOR_PANIC, ERR_REJECTED, ERR_UNKNOWN};
use crate::run::{ExecutionHandle, RunHandle, RunStatus, SessionContext, TaskRun, handle_pair};
use crate::scheduler::queue::{Cancellation, Dequeued, RunQueue};
use crate::task::Task;
use crate::trace::Tracer;

/// Submits runs and drives them through a bounded pool of workers.
pub struct Dispatcher {
    config: SchedulerConfig,
    queue: Arc<RunQueue>,
    ambient: Arc<SessionContext>,
    history: Arc<RunHistory>,
    registry: Arc<ProcessorRegistry>,
    tracer: Option<Tracer>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher. Runs execute in contexts isolated from `ambient`.
    pub fn new(
        config: SchedulerConfig,
        ambient: SessionContext,
        history: Arc<RunHistory>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        let queue = Arc::new(RunQueue::new(config.task_runs_queue_length));
        Self {
            config,
            queue,
            ambient: Arc::new(ambient),
            history,
            registry,
            tracer: None,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// The caller context runs are isolated from. Never mutated by runs.
    pub fn ambient(&self) -> &SessionContext {
        &self.ambient
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    pub fn history(&self) -> &Arc<RunHistory> {
        &self.history
    }

    /// Build a `PENDING` run of `task` with a fresh query id, using the
    /// processor registered for the task's kind.
    pub async fn create_run(
        &self,
        task: Arc<Task>,
        properties: BTreeMap<String, String>,
    ) -> Result<TaskRun, RunError> {
        let processor = self.registry.get(task.kind).await?;
        let mut run = TaskRun::new(task, properties, processor);
        if let Some(tracer) = &self.tracer {
            run = run.with_tracer(tracer.clone());
        }
        run.init_status(Uuid::new_v4().to_string(), None, self.config.task_runs_ttl_second)?;
        Ok(run)
    }

    /// Persist the run's `PENDING` record and queue it.
    ///
    /// A run the queue refuses is recorded as failed, so the log never keeps
    /// a `PENDING` record for a run that will not execute.
    pub async fn submit(&self, mut run: TaskRun) -> Result<RunHandle, QueueError> {
        let status = run.status().cloned().ok_or_else(|| RunError::MissingStatus {
            query_id: run.task().name.clone(),
        })?;
        let query_id = status.query_id().to_string();
        if self.history.get(&query_id).await.is_some() || self.queue.contains(&query_id).await {
            return Err(QueueError::Duplicate { query_id });
        }
        if self.queue.len().await >= self.queue.capacity() {
            return Err(QueueError::Full {
                capacity: self.queue.capacity(),
            });
        }

        let (exec, handle) = handle_pair(&query_id);
        run.attach_handle(exec);
        persist(&self.history, &status).await;

        let rejected = match self.queue.submit(run).await {
            Ok(()) => {
                tracing::info!(query_id = %query_id, "Task run submitted");
                return Ok(handle);
            }
            Err(e) => e,
        };

        // The run was consumed by the failed submit; record the rejection from
        // the persisted record.
        if let Some(mut status) = self.history.get(&query_id).await {
            let now = Utc::now().timestamp_millis();
            if status.mark_failed(ERR_REJECTED, rejected.to_string(), now).is_ok() {
                persist(&self.history, &status).await;
            }
        }
        tracing::warn!(query_id = %query_id, error = %rejected, "Task run rejected");
        Err(rejected)
    }

    /// Change the priority of a queued run. The change is persisted before
    /// any worker can claim the run.
    pub async fn set_priority(&self, query_id: &str, priority: i32) -> Result<RunStatus, QueueError> {
        let history = &self.history;
        self.queue
            .set_priority_with(query_id, priority, |status| async move {
                persist(history, &status).await;
            })
            .await
    }

    /// Cancel a queued or running run. Returns false if no such run is live.
    pub async fn cancel(&self, query_id: &str) -> bool {
        match self.queue.cancel(query_id).await {
            Ok(Cancellation::Queued(mut run)) => {
                let handle = run.take_handle();
                finish(&self.history, &run, handle).await;
                true
            }
            Ok(Cancellation::Running) => true,
            Err(QueueError::NotQueued { .. }) => false,
            Err(e) => {
                tracing::warn!(query_id = %query_id, error = %e, "Cancel failed");
                false
            }
        }
    }

    /// Latest status of a run, queued or finished.
    pub async fn status(&self, query_id: &str) -> Option<RunStatus> {
        self.history.get(query_id).await
    }

    /// Spawn the worker pool. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for id in 0..self.config.task_runs_concurrency {
            workers.push(tokio::spawn(worker_loop(
                id,
                self.queue.clone(),
                self.ambient.clone(),
                self.history.clone(),
            )));
        }
        tracing::info!(
            workers = self.config.task_runs_concurrency,
            queue_length = self.queue.capacity(),
            "Dispatcher started"
        );
    }

    /// Close the queue, let workers drain it, and wait for them to exit.
    pub async fn shutdown(&self) {
        self.queue.close().await;
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for result in join_all(workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker exited abnormally");
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<RunQueue>,
    ambient: Arc<SessionContext>,
    history: Arc<RunHistory>,
) {
    tracing::debug!(worker = id, "Worker started");
    while let Some(dequeued) = queue.next_for(&ambient).await {
        match dequeued {
            Dequeued::Rejected(mut run, e) => {
                tracing::warn!(worker = id, query_id = ?run.query_id(), error = %e, "Task run rejected at dispatch");
                let handle = run.take_handle();
                finish(&history, &run, handle).await;
            }
            Dequeued::Admitted(mut run, ctx) => {
                let handle = run.take_handle();
                let Some(snapshot) = run.status().cloned() else {
                    tracing::error!(worker = id, task = %run.task().name, "Claimed run has no status");
                    if let Some(handle) = handle {
                        let status = orphan_status(&run, handle.query_id());
                        queue.release(handle.query_id()).await;
                        complete(&history, &status, Some(handle)).await;
                    }
                    continue;
                };
                let query_id = snapshot.query_id().to_string();
                persist(&history, &snapshot).await;

                let execution = tokio::spawn(async move {
                    let result = run.execute_isolated(ctx).await;
                    (run, result)
                });
                match execution.await {
                    Ok((run, result)) => {
                        if let Err(e) = result {
                            tracing::warn!(worker = id, query_id = %query_id, error = %e, "Task run errored");
                        }
                        finish(&history, &run, handle).await;
                    }
                    Err(e) => {
                        tracing::error!(worker = id, query_id = %query_id, error = %e, "Task run panicked");
                        let mut status = snapshot;
                        let now = Utc::now().timestamp_millis();
                        if let Err(e) =
                            status.mark_failed(ERR_PROCESSOR_PANIC, format!("job logic panicked: {e}"), now)
                        {
                            tracing::warn!(query_id = %query_id, error = %e, "Could not fail panicked run");
                        }
                        complete(&history, &status, handle).await;
                    }
                }
                queue.release(&query_id).await;
            }
        }
    }
    tracing::debug!(worker = id, "Worker stopped");
}

/// A failed status for a claimed run that lost its own.
fn orphan_status(run: &TaskRun, query_id: &str) -> RunStatus {
    let now = Utc::now().timestamp_millis();
    let mut status = RunStatus::new(query_id, run.task(), now, 0);
    if let Err(e) = status.mark_failed(ERR_UNKNOWN, "claimed run has no status", now) {
        tracing::warn!(query_id = %query_id, error = %e, "Could not fail orphaned run");
    }
    status
}

async fn finish(history: &RunHistory, run: &TaskRun, handle: Option<ExecutionHandle>) {
    if let Some(status) = run.status() {
        complete(history, status, handle).await;
    }
}

async fn complete(history: &RunHistory, status: &RunStatus, handle: Option<ExecutionHandle>) {
    persist(history, status).await;
    tracing::info!(
        query_id = %status.query_id(),
        state = %status.state(),
        error_code = status.error_code(),
        "Task run finished"
    );
    if let Some(mut handle) = handle {
        handle.complete(status);
    }
}

async fn persist(history: &RunHistory, status: &RunStatus) {
    if let Err(e) = history.record(status).await {
        tracing::error!(
            query_id = %status.query_id(),
            state = %status.state(),
            error = %e,
            "Failed to persist run status"
        );
    }
}
