//! Durable run status record.
//!
//! One `RunStatus` exists per task run. It is created in `PENDING` when the run
//! is submitted, moved through the state machine by the dispatcher and the run
//! itself, and appended to the status log on every change. The JSON encoding
//! is the recovery format: field names are stable and unknown fields written by
//! newer versions are kept and written back unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CodecError, RunError};
use crate::run::state::{ERR_UNKNOWN, RunState};
use crate::task::Task;

/// Current record format version.
pub const RECORD_VERSION: u32 = 1;

fn record_version() -> u32 {
    RECORD_VERSION
}

/// Durable record of one run's identity, timing, outcome and priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    #[serde(default = "record_version")]
    version: u32,
    query_id: String,
    task_name: String,
    create_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finish_time: Option<i64>,
    state: RunState,
    db_name: String,
    definition: String,
    #[serde(default)]
    error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    expire_time: i64,
    /// Larger value means higher priority.
    #[serde(default)]
    priority: i32,
    /// The run's effective properties: task defaults overlaid with the caller's.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<String, String>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    extensions: Map<String, Value>,
}

impl RunStatus {
    /// Create a `PENDING` status for a run of `task`.
    pub fn new(query_id: impl Into<String>, task: &Task, create_time: i64, ttl_millis: i64) -> Self {
        Self {
            version: RECORD_VERSION,
            query_id: query_id.into(),
            task_name: task.name.clone(),
            create_time,
            finish_time: None,
            state: RunState::Pending,
            db_name: task.db_name.clone(),
            definition: task.definition.clone(),
            error_code: 0,
            error_message: None,
            expire_time: create_time.saturating_add(ttl_millis),
            priority: 0,
            properties: BTreeMap::new(),
            extensions: Map::new(),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn create_time(&self) -> i64 {
        self.create_time
    }

    pub fn finish_time(&self) -> Option<i64> {
        self.finish_time
    }

    pub fn expire_time(&self) -> i64 {
        self.expire_time
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expire_time
    }

    /// Move to a non-terminal state.
    pub fn mark_running(&mut self) -> Result<(), RunError> {
        self.transition_to(RunState::Running)
    }

    /// Finish successfully.
    pub fn mark_success(&mut self, now_millis: i64) -> Result<(), RunError> {
        self.transition_to(RunState::Success)?;
        self.finish(now_millis);
        Ok(())
    }

    /// Finish with an error. A zero code is recorded as `ERR_UNKNOWN` and an
    /// empty message is replaced so that a failed record always explains itself.
    pub fn mark_failed(
        &mut self,
        error_code: i32,
        message: impl Into<String>,
        now_millis: i64,
    ) -> Result<(), RunError> {
        self.transition_to(RunState::Failed)?;
        let message = message.into();
        self.error_code = if error_code == 0 { ERR_UNKNOWN } else { error_code };
        self.error_message = Some(if message.trim().is_empty() {
            "unknown error".to_string()
        } else {
            message
        });
        self.finish(now_millis);
        Ok(())
    }

    fn transition_to(&mut self, target: RunState) -> Result<(), RunError> {
        if !self.state.can_transition_to(target) {
            return Err(RunError::InvalidTransition {
                query_id: self.query_id.clone(),
                state: self.state.to_string(),
                target: target.to_string(),
            });
        }
        self.state = target;
        Ok(())
    }

    fn finish(&mut self, now_millis: i64) {
        // Only reachable through a terminal transition, which happens once.
        self.finish_time = Some(now_millis.max(self.create_time));
    }

    /// Encode as the self-describing JSON record.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON record, checking record invariants.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let status: RunStatus = serde_json::from_slice(bytes)?;
        status.validate()?;
        Ok(status)
    }

    fn validate(&self) -> Result<(), CodecError> {
        let invariant = |reason: &str| CodecError::Invariant {
            query_id: self.query_id.clone(),
            reason: reason.to_string(),
        };

        if self.query_id.is_empty() {
            return Err(invariant("empty queryId"));
        }
        match (self.state.is_terminal(), self.finish_time) {
            (true, None) => return Err(invariant("terminal run without finishTime")),
            (false, Some(_)) => return Err(invariant("finishTime set on a non-terminal run")),
            _ => {}
        }
        if let Some(finish) = self.finish_time {
            if finish < self.create_time {
                return Err(invariant("finishTime precedes createTime"));
            }
        }
        if self.state != RunState::Failed && self.error_code != 0 {
            return Err(invariant("errorCode set on a run that did not fail"));
        }
        let has_message = self
            .error_message
            .as_deref()
            .is_some_and(|m| !m.is_empty());
        match (self.state, has_message) {
            (RunState::Failed, false) => Err(invariant("FAILED run without errorMessage")),
            (RunState::Failed, true) => Ok(()),
            (_, true) => Err(invariant("errorMessage set on a run that did not fail")),
            (_, false) => Ok(()),
        }
    }
}
