//! A single execution attempt of a task.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use crate::error::RunError;
use crate::processor::{TaskRunContext, TaskRunProcessor};
use crate::run::context::{IsolatedContext, IsolationRequest, SessionContext, isolate};
use crate::run::handle::{CancellationToken, ExecutionHandle};
use crate::run::state::{ERR_CANCELLED, ERR_CONTEXT_ISOLATION, ERR_UNKNOWN, RunState};
use crate::run::status::RunStatus;
use crate::task::Task;
use crate::trace::Tracer;

/// One run of a task: the task, the caller's properties, the job logic to
/// delegate to, and the run's status. Never persisted itself; its status is.
pub struct TaskRun {
    task: Arc<Task>,
    properties: BTreeMap<String, String>,
    processor: Arc<dyn TaskRunProcessor>,
    status: Option<RunStatus>,
    handle: Option<ExecutionHandle>,
    token: Option<CancellationToken>,
    tracer: Option<Tracer>,
}

impl TaskRun {
    /// Create a run. The task's default properties apply unless `properties`
    /// overrides them.
    pub fn new(
        task: Arc<Task>,
        properties: BTreeMap<String, String>,
        processor: Arc<dyn TaskRunProcessor>,
    ) -> Self {
        let mut merged = task.properties.clone();
        merged.extend(properties);
        Self {
            task,
            properties: merged,
            processor,
            status: None,
            handle: None,
            token: None,
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn task_id(&self) -> u64 {
        self.task.id
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn processor(&self) -> &Arc<dyn TaskRunProcessor> {
        &self.processor
    }

    /// Create this run's `PENDING` status. `create_time` defaults to now.
    pub fn init_status(
        &mut self,
        query_id: impl Into<String>,
        create_time: Option<i64>,
        ttl_second: u64,
    ) -> Result<&RunStatus, RunError> {
        if let Some(existing) = &self.status {
            return Err(RunError::InvalidTransition {
                query_id: existing.query_id().to_string(),
                state: existing.state().to_string(),
                target: RunState::Pending.to_string(),
            });
        }
        let create_time = create_time.unwrap_or_else(|| Utc::now().timestamp_millis());
        let ttl_millis = (ttl_second as i64).saturating_mul(1000);
        Ok(self
            .status
            .insert(
                RunStatus::new(query_id, &self.task, create_time, ttl_millis)
                    .with_properties(self.properties.clone()),
            ))
    }

    pub fn status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    pub fn status_mut(&mut self) -> Option<&mut RunStatus> {
        self.status.as_mut()
    }

    pub fn into_status(self) -> Option<RunStatus> {
        self.status
    }

    pub fn query_id(&self) -> Option<&str> {
        self.status.as_ref().map(RunStatus::query_id)
    }

    pub fn priority(&self) -> i32 {
        self.status.as_ref().map_or(0, RunStatus::priority)
    }

    pub fn create_time(&self) -> i64 {
        self.status.as_ref().map_or(0, RunStatus::create_time)
    }

    /// Attach the execution handle. Set once, when the run is submitted.
    pub fn attach_handle(&mut self, handle: ExecutionHandle) {
        if self.token.is_some() {
            tracing::warn!(query_id = ?self.query_id(), "Execution handle already attached");
            return;
        }
        self.token = Some(handle.token().clone());
        self.handle = Some(handle);
    }

    /// Detach the result slot. The run keeps honoring the cancellation token.
    pub fn take_handle(&mut self) -> Option<ExecutionHandle> {
        self.handle.take()
    }

    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Publish the current status to the submitter's handle.
    pub fn complete_handle(&mut self) {
        if let (Some(handle), Some(status)) = (self.handle.as_mut(), self.status.as_ref()) {
            handle.complete(status);
        }
    }

    fn status_or_err(&mut self) -> Result<&mut RunStatus, RunError> {
        let task_name = &self.task.name;
        self.status.as_mut().ok_or_else(|| RunError::MissingStatus {
            query_id: task_name.clone(),
        })
    }

    /// Build this run's private execution context from the caller's context.
    pub fn isolate(&self, ambient: &SessionContext) -> Result<IsolatedContext, RunError> {
        let status = self.status.as_ref().ok_or_else(|| RunError::MissingStatus {
            query_id: self.task.name.clone(),
        })?;
        isolate(
            ambient,
            IsolationRequest {
                query_id: status.query_id(),
                database: &self.task.db_name,
                properties: &self.properties,
            },
        )
    }

    /// Fail the run from any non-terminal state.
    pub fn fail(&mut self, error_code: i32, message: impl Into<String>) -> Result<(), RunError> {
        let now = Utc::now().timestamp_millis();
        self.status_or_err()?.mark_failed(error_code, message, now)
    }

    /// Isolate and execute. Returns `Ok(false)` when the job logic failed or
    /// the run was cancelled; an isolation failure fails the run and is
    /// returned as the error.
    pub async fn execute(&mut self, ambient: &SessionContext) -> Result<bool, RunError> {
        let isolated = match self.isolate(ambient) {
            Ok(isolated) => isolated,
            Err(e) => {
                if !matches!(e, RunError::MissingStatus { .. }) {
                    self.fail(ERR_CONTEXT_ISOLATION, e.to_string())?;
                }
                return Err(e);
            }
        };
        self.execute_isolated(isolated).await
    }

    /// Execute in an already isolated context. Exactly one invocation of the
    /// job logic; no retry.
    pub async fn execute_isolated(&mut self, isolated: IsolatedContext) -> Result<bool, RunError> {
        let status = self.status_or_err()?;
        if status.state() == RunState::Pending {
            status.mark_running()?;
        }
        let query_id = status.query_id().to_string();
        let mut context = TaskRunContext::new(isolated, status.definition());

        if let Some(tracer) = &self.tracer {
            context.trace_parent = tracer.start_span("task_run", None).to_trace_parent();
        }

        let span = tracing::info_span!(
            "task_run",
            query_id = %query_id,
            task = %self.task.name,
            processor = %self.processor.name()
        );
        let processor = Arc::clone(&self.processor);
        let token = self.token.clone();

        let finished = async {
            match token {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => false,
                        _ = processor.process_task_run(&mut context) => true,
                    }
                }
                None => {
                    processor.process_task_run(&mut context).await;
                    true
                }
            }
        }
        .instrument(span)
        .await;

        let now = Utc::now().timestamp_millis();
        let status = self.status_or_err()?;
        if !finished {
            tracing::info!(query_id = %query_id, "Task run cancelled");
            status.mark_failed(ERR_CANCELLED, "task run was cancelled", now)?;
            return Ok(false);
        }

        let state = &context.ctx.state;
        if state.is_error() {
            let error_code = state.error_code().unwrap_or(ERR_UNKNOWN);
            tracing::warn!(
                query_id = %query_id,
                error_code,
                error = %state.error_message(),
                "Task run failed"
            );
            status.mark_failed(error_code, state.error_message(), now)?;
            return Ok(false);
        }

        status.mark_success(now)?;
        tracing::info!(query_id = %query_id, "Task run succeeded");
        Ok(true)
    }
}

impl std::fmt::Debug for TaskRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRun")
            .field("task", &self.task.name)
            .field("properties", &self.properties)
            .field("processor", &self.processor.name())
            .field("status", &self.status)
            .finish()
    }
}

/// Queue order: higher priority first, then earlier creation time. Remaining
/// ties fall back to the query id so the order stays total.
impl Ord for TaskRun {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority()
            .cmp(&self.priority())
            .then_with(|| self.create_time().cmp(&other.create_time()))
            .then_with(|| self.query_id().cmp(&other.query_id()))
    }
}

impl PartialOrd for TaskRun {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TaskRun {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TaskRun {}
