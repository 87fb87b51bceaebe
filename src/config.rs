//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Service name reported by the tracer.
    pub service_name: String,
    /// How long a run status is kept after creation, in seconds.
    pub task_runs_ttl_second: u64,
    /// Number of parallel workers pulling from the run queue.
    pub task_runs_concurrency: usize,
    /// Maximum number of pending runs held by the queue.
    pub task_runs_queue_length: usize,
    /// Interval between retention sweeps of expired run history.
    pub retention_sweep_interval: Duration,
    /// Path of the libSQL status log.
    pub db_path: PathBuf,
    /// Trace collector endpoint. Tracing is disabled when unset.
    pub trace_endpoint: Option<String>,
    /// Directory for daily rolling log files, in addition to stderr.
    pub log_dir: Option<PathBuf>,
    /// Databases runs may execute in.
    pub databases: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            service_name: "task-scheduler".to_string(),
            task_runs_ttl_second: 3 * 24 * 3600, // 3 days
            task_runs_concurrency: 4,
            task_runs_queue_length: 500,
            retention_sweep_interval: Duration::from_secs(60),
            db_path: PathBuf::from("./data/task-scheduler.db"),
            trace_endpoint: None,
            log_dir: None,
            databases: vec!["default".to_string()],
        }
    }
}

impl SchedulerConfig {
    /// Build a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let task_runs_concurrency: usize = parse_or(
            &lookup,
            "TASK_RUNS_CONCURRENCY",
            defaults.task_runs_concurrency,
        )?;
        if task_runs_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASK_RUNS_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let sweep_secs: u64 = parse_or(
            &lookup,
            "TASK_RUNS_SWEEP_INTERVAL_SECS",
            defaults.retention_sweep_interval.as_secs(),
        )?;

        Ok(Self {
            service_name: lookup("TASK_SCHEDULER_SERVICE_NAME").unwrap_or(defaults.service_name),
            task_runs_ttl_second: parse_or(
                &lookup,
                "TASK_RUNS_TTL_SECOND",
                defaults.task_runs_ttl_second,
            )?,
            task_runs_concurrency,
            task_runs_queue_length: parse_or(
                &lookup,
                "TASK_RUNS_QUEUE_LENGTH",
                defaults.task_runs_queue_length,
            )?,
            retention_sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            db_path: lookup("TASK_SCHEDULER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            trace_endpoint: lookup("TASK_SCHEDULER_TRACE_ENDPOINT").filter(|s| !s.is_empty()),
            log_dir: lookup("TASK_SCHEDULER_LOG_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            databases: lookup("TASK_SCHEDULER_DATABASES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.databases),
        })
    }

    /// Run status time-to-live in milliseconds.
    pub fn ttl_millis(&self) -> i64 {
        (self.task_runs_ttl_second as i64).saturating_mul(1000)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
