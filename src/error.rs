//! Error types for the task scheduler.

use thiserror::Error;

/// Top-level error type for the scheduler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Variable error: {0}")]
    Variable(#[from] VariableError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Status log persistence errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] CodecError),

    #[error("Run {query_id} is {current}; refusing {incoming} record")]
    StaleRecord {
        query_id: String,
        current: String,
        incoming: String,
    },
}

/// Errors decoding or encoding a durable run status record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed run status record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Run status record {query_id} violates invariant: {reason}")]
    Invariant { query_id: String, reason: String },
}

/// Errors raised while preparing or driving a task run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {query_id} has no status; call init_status before submitting")]
    MissingStatus { query_id: String },

    #[error("Run {query_id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        query_id: String,
        state: String,
        target: String,
    },

    #[error("Run {query_id} context isolation failed: {reason}")]
    ContextIsolation { query_id: String, reason: String },

    #[error("No processor registered for job kind {kind}")]
    ProcessorNotFound { kind: String },

    #[error("Run {query_id} was cancelled")]
    Cancelled { query_id: String },

    #[error("Run {query_id} result was dropped before completion")]
    ResultDropped { query_id: String },
}

/// Run queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Run queue is full ({capacity} pending runs)")]
    Full { capacity: usize },

    #[error("Run {query_id} is already queued")]
    Duplicate { query_id: String },

    #[error("Run {query_id} is in state {state}; only pending runs can be queued")]
    NotPending { query_id: String, state: String },

    #[error("Run {query_id} is not queued")]
    NotQueued { query_id: String },

    #[error("Run queue is closed")]
    Closed,

    #[error(transparent)]
    Run(#[from] RunError),
}

/// Session variable assignment errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariableError {
    #[error("Unknown system variable '{0}'")]
    Unknown(String),

    #[error("Invalid value '{value}' for variable '{name}': {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
}

/// Task definition errors.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Unknown job kind '{0}'")]
    UnknownKind(String),

    #[error("Task {name} not found")]
    NotFound { name: String },

    #[error("Task {name} already exists")]
    AlreadyExists { name: String },
}

/// Console command parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid {name} '{value}'")]
    InvalidArgument { name: &'static str, value: String },
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
