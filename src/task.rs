//! Task definitions.
//!
//! A task is the durable definition a run executes: a name, an owning
//! database, the SQL definition text, and a schedule. Runs copy the fields they
//! need into their status so history survives later changes to the task.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// The kind of job logic a task delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Plain maintenance SQL.
    Sql,
    /// Statistics collection.
    Statistics,
    /// Materialized view refresh.
    MvRefresh,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sql => "sql",
            JobKind::Statistics => "statistics",
            JobKind::MvRefresh => "mv_refresh",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sql" => Ok(JobKind::Sql),
            "statistics" | "analyze" => Ok(JobKind::Statistics),
            "mv_refresh" | "refresh" => Ok(JobKind::MvRefresh),
            other => Err(TaskError::UnknownKind(other.to_string())),
        }
    }
}

/// When a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSchedule {
    /// Runs only when submitted explicitly.
    Manual,
    /// Runs on a cron schedule.
    Periodic { cron: String },
}

impl TaskSchedule {
    /// Build a periodic schedule, validating the cron expression.
    pub fn periodic(expression: impl Into<String>) -> Result<Self, TaskError> {
        let expression = expression.into();
        cron::Schedule::from_str(&expression).map_err(|e| TaskError::InvalidSchedule {
            expression: expression.clone(),
            reason: e.to_string(),
        })?;
        Ok(TaskSchedule::Periodic { cron: expression })
    }

    /// Next fire time after now, if the schedule is periodic.
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_after(Utc::now())
    }

    /// First fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TaskSchedule::Manual => None,
            TaskSchedule::Periodic { cron } => cron::Schedule::from_str(cron)
                .ok()
                .and_then(|s| s.after(&after).next()),
        }
    }

    /// Display label used by the status surface.
    pub fn schedule_type(&self) -> &'static str {
        match self {
            TaskSchedule::Manual => "ONCE",
            TaskSchedule::Periodic { .. } => "SCHEDULE",
        }
    }
}

/// A durable job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub name: String,
    pub db_name: String,
    pub definition: String,
    pub kind: JobKind,
    pub schedule: TaskSchedule,
    /// Target table, for jobs scoped to one.
    #[serde(default)]
    pub table: Option<String>,
    /// Column scope; empty means all columns.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Default run properties, merged under the caller's per-run properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Task {
    /// Create a manually scheduled task.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        db_name: impl Into<String>,
        definition: impl Into<String>,
        kind: JobKind,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            db_name: db_name.into(),
            definition: definition.into(),
            kind,
            schedule: TaskSchedule::Manual,
            table: None,
            columns: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: TaskSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_table(mut self, table: impl Into<String>, columns: Vec<String>) -> Self {
        self.table = Some(table.into());
        self.columns = columns;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
