//! Execution contexts and per-run isolation.
//!
//! The ambient `SessionContext` belongs to the caller and is shared read-only
//! between workers. Before a run executes, `isolate` builds a private snapshot:
//! identity, cluster and state manager are shared, the session variables are
//! copied and overridden from the run's properties, and result state starts
//! clean and tagged with the run's own query id.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::RunError;
use crate::run::session::SessionVariables;

/// Read access to cluster metadata.
pub trait StateManager: Send + Sync {
    /// Whether a database with this name exists.
    fn database_exists(&self, name: &str) -> bool;
}

/// Fixed set of databases, for the binary and tests.
#[derive(Debug, Default)]
pub struct InMemoryStateManager {
    databases: HashSet<String>,
}

impl InMemoryStateManager {
    pub fn new<I, S>(databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            databases: databases.into_iter().map(Into::into).collect(),
        }
    }
}

impl StateManager for InMemoryStateManager {
    fn database_exists(&self, name: &str) -> bool {
        self.databases.contains(name)
    }
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user: String,
    pub host: String,
}

impl UserIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl std::fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}'@'{}'", self.user, self.host)
    }
}

/// Outcome class of the last statement run in a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStateKind {
    #[default]
    Ok,
    Eof,
    Err,
}

/// Result/error state of a context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryState {
    kind: QueryStateKind,
    error_message: String,
    error_code: Option<i32>,
    affected_rows: u64,
}

impl QueryState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn kind(&self) -> QueryStateKind {
        self.kind
    }

    pub fn is_error(&self) -> bool {
        self.kind == QueryStateKind::Err
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error_code
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn set_ok(&mut self, affected_rows: u64) {
        self.kind = QueryStateKind::Ok;
        self.affected_rows = affected_rows;
    }

    pub fn set_eof(&mut self) {
        self.kind = QueryStateKind::Eof;
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.kind = QueryStateKind::Err;
        self.error_message = message.into();
        self.error_code = None;
    }

    pub fn set_error_with_code(&mut self, message: impl Into<String>, code: i32) {
        self.set_error(message);
        self.error_code = Some(code);
    }
}

/// A session/connection context.
#[derive(Clone, Default)]
pub struct SessionContext {
    pub cluster: String,
    pub database: String,
    pub qualified_user: String,
    pub user_identity: Option<UserIdentity>,
    pub session_variables: SessionVariables,
    pub state_manager: Option<Arc<dyn StateManager>>,
    pub query_id: Option<Uuid>,
    pub state: QueryState,
    /// Caller's `host:port`.
    pub remote_addr: Option<String>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("cluster", &self.cluster)
            .field("database", &self.database)
            .field("qualified_user", &self.qualified_user)
            .field("user_identity", &self.user_identity)
            .field("session_variables", &self.session_variables)
            .field("has_state_manager", &self.state_manager.is_some())
            .field("query_id", &self.query_id)
            .field("state", &self.state)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl SessionContext {
    /// A context authenticated as `user`, backed by `state_manager`.
    pub fn new(
        cluster: impl Into<String>,
        user: UserIdentity,
        state_manager: Arc<dyn StateManager>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            qualified_user: user.user.clone(),
            user_identity: Some(user),
            state_manager: Some(state_manager),
            ..Default::default()
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

/// What a run asks of the isolator.
#[derive(Debug, Clone, Copy)]
pub struct IsolationRequest<'a> {
    pub query_id: &'a str,
    /// Database the run executes in (the task's database).
    pub database: &'a str,
    pub properties: &'a BTreeMap<String, String>,
}

/// A run's private context plus the properties that were not session variables.
#[derive(Debug, Clone)]
pub struct IsolatedContext {
    pub session: SessionContext,
    pub custom_properties: BTreeMap<String, String>,
    pub remote_addr: String,
}

/// Build a private execution context for one run.
///
/// Every property lands in exactly one place: it is applied as a session
/// variable when `set_var` accepts it, otherwise it goes to
/// `custom_properties`.
pub fn isolate(
    ambient: &SessionContext,
    request: IsolationRequest<'_>,
) -> Result<IsolatedContext, RunError> {
    let fail = |reason: String| RunError::ContextIsolation {
        query_id: request.query_id.to_string(),
        reason,
    };

    let query_id = Uuid::parse_str(request.query_id)
        .map_err(|e| fail(format!("query id is not a UUID: {e}")))?;
    let user_identity = ambient
        .user_identity
        .clone()
        .ok_or_else(|| fail("ambient context has no authenticated user".to_string()))?;
    let state_manager = ambient
        .state_manager
        .clone()
        .ok_or_else(|| fail("ambient context has no state manager".to_string()))?;
    if !state_manager.database_exists(request.database) {
        return Err(fail(format!("unknown database '{}'", request.database)));
    }

    let mut session_variables = ambient.session_variables.clone();
    let mut custom_properties = BTreeMap::new();
    for (key, value) in request.properties {
        if let Err(e) = session_variables.set_var(key, value) {
            tracing::debug!(
                query_id = %query_id,
                property = %key,
                reason = %e,
                "Property is not a session variable; passing to job logic"
            );
            custom_properties.insert(key.clone(), value.clone());
        }
    }

    let session = SessionContext {
        cluster: ambient.cluster.clone(),
        database: request.database.to_string(),
        qualified_user: ambient.qualified_user.clone(),
        user_identity: Some(user_identity),
        session_variables,
        state_manager: Some(state_manager),
        query_id: Some(query_id),
        state: QueryState::default(),
        remote_addr: ambient.remote_addr.clone(),
    };

    Ok(IsolatedContext {
        session,
        custom_properties,
        remote_addr: ambient.remote_addr.clone().unwrap_or_default(),
    })
}
