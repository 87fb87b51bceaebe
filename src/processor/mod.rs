//! Pluggable job logic.
//!
//! A processor receives a run's isolated context and does the actual work. It
//! reports failure only by leaving the context's query state in error.

pub mod registry;
pub mod sql;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::run::context::{IsolatedContext, SessionContext};

pub use registry::ProcessorRegistry;
pub use sql::{DryRunExecutor, SqlTaskProcessor, StatementError, StatementExecutor};

/// Everything a processor gets for one run.
#[derive(Debug, Clone)]
pub struct TaskRunContext {
    /// The run's private session context.
    pub ctx: SessionContext,
    /// The task's SQL definition, as captured in the run status.
    pub definition: String,
    /// Run properties that were not session variables.
    pub properties: BTreeMap<String, String>,
    /// Caller's network origin.
    pub remote_ip: String,
    /// W3C traceparent of the run's span, when tracing is enabled.
    pub trace_parent: Option<String>,
}

impl TaskRunContext {
    pub fn new(isolated: IsolatedContext, definition: impl Into<String>) -> Self {
        Self {
            ctx: isolated.session,
            definition: definition.into(),
            properties: isolated.custom_properties,
            remote_ip: isolated.remote_addr,
            trace_parent: None,
        }
    }
}

/// Job logic invoked by a task run.
#[async_trait]
pub trait TaskRunProcessor: Send + Sync {
    /// Processor name, for logs.
    fn name(&self) -> &str;

    /// Execute the run. Failures are signalled through `context.ctx.state`.
    async fn process_task_run(&self, context: &mut TaskRunContext);
}
