//! Task runs: status records, execution contexts, and the run itself.

pub mod context;
pub mod handle;
pub mod session;
pub mod state;
pub mod status;
pub mod task_run;

pub use context::{
    InMemoryStateManager, IsolatedContext, IsolationRequest, QueryState, SessionContext,
    StateManager, UserIdentity, isolate,
};
pub use handle::{CancellationToken, ExecutionHandle, RunHandle, handle_pair};
pub use session::SessionVariables;
pub use state::RunState;
pub use status::RunStatus;
pub use task_run::TaskRun;
