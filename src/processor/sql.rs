//! SQL job logic.
//!
//! `SqlTaskProcessor` runs a task's definition statement by statement through
//! a `StatementExecutor`, the consumed interface to the SQL engine. Errors are
//! folded into the run context's query state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::processor::{TaskRunContext, TaskRunProcessor};
use crate::run::context::SessionContext;

/// A statement failure reported by the SQL engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementError {
    pub message: String,
    pub code: Option<i32>,
}

impl StatementError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl std::fmt::Display for StatementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Executes a single SQL statement in a session context.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Returns the number of affected rows.
    async fn execute(&self, ctx: &SessionContext, statement: &str) -> Result<u64, StatementError>;
}

/// Executor that only logs statements.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl StatementExecutor for DryRunExecutor {
    async fn execute(&self, ctx: &SessionContext, statement: &str) -> Result<u64, StatementError> {
        tracing::info!(
            database = %ctx.database,
            query_id = ?ctx.query_id,
            statement = %statement,
            "Dry-run statement"
        );
        Ok(0)
    }
}

/// Runs a task definition as a sequence of SQL statements.
pub struct SqlTaskProcessor {
    name: String,
    executor: Arc<dyn StatementExecutor>,
}

impl SqlTaskProcessor {
    pub fn new(name: impl Into<String>, executor: Arc<dyn StatementExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
        }
    }
}

#[async_trait]
impl TaskRunProcessor for SqlTaskProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_task_run(&self, context: &mut TaskRunContext) {
        let statements = split_statements(&context.definition);
        if statements.is_empty() {
            context.ctx.state.set_error("task definition contains no statements");
            return;
        }

        let timeout = Duration::from_secs(context.ctx.session_variables.query_timeout as u64);
        let mut affected = 0;
        for statement in statements {
            tracing::debug!(
                processor = %self.name,
                query_id = ?context.ctx.query_id,
                statement = %statement,
                "Executing statement"
            );
            let result =
                tokio::time::timeout(timeout, self.executor.execute(&context.ctx, statement)).await;
            match result {
                Ok(Ok(rows)) => affected += rows,
                Ok(Err(e)) => {
                    match e.code {
                        Some(code) => context.ctx.state.set_error_with_code(e.message, code),
                        None => context.ctx.state.set_error(e.message),
                    }
                    return;
                }
                Err(_) => {
                    context.ctx.state.set_error(format!(
                        "statement timed out after {}s",
                        timeout.as_secs()
                    ));
                    return;
                }
            }
        }
        context.ctx.state.set_ok(affected);
    }
}

/// Split on `;` outside single- and double-quoted literals.
fn split_statements(definition: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in definition.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, ';') => {
                statements.push(&definition[start..i]);
                start = i + 1;
            }
            (None, _) => {}
        }
    }
    statements.push(&definition[start..]);

    statements
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
