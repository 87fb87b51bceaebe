//! End-to-end tests: dispatcher, isolation, failure capture, cancellation and
//! recovery against a real libSQL status log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Barrier, Mutex};

use task_scheduler::config::SchedulerConfig;
use task_scheduler::error::DatabaseError;
use task_scheduler::history::RunHistory;
use task_scheduler::processor::{
    ProcessorRegistry, SqlTaskProcessor, StatementError, StatementExecutor, TaskRunContext,
    TaskRunProcessor,
};
use task_scheduler::run::state::{ERR_CANCELLED, ERR_INTERRUPTED};
use task_scheduler::run::{
    InMemoryStateManager, RunState, RunStatus, SessionContext, UserIdentity,
};
use task_scheduler::scheduler::Dispatcher;
use task_scheduler::store::{LibSqlStatusLog, LogEntry, StatusLog};
use task_scheduler::task::{JobKind, Task};

fn ambient() -> SessionContext {
    let mut ambient = SessionContext::new(
        "default_cluster",
        UserIdentity::new("root", "%"),
        Arc::new(InMemoryStateManager::new(["db1"])),
    )
    .with_remote_addr("10.0.0.7:50123");
    ambient
        .session_variables
        .set_var("query_timeout", "1")
        .unwrap();
    ambient
}

fn config(concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        task_runs_concurrency: concurrency,
        task_runs_ttl_second: 3600,
        ..Default::default()
    }
}

async fn dispatcher_with(
    concurrency: usize,
    kind: JobKind,
    processor: Arc<dyn TaskRunProcessor>,
) -> Dispatcher {
    let log = Arc::new(LibSqlStatusLog::new_memory().await.unwrap());
    let registry = Arc::new(ProcessorRegistry::new());
    registry.register(kind, processor).await;
    Dispatcher::new(
        config(concurrency),
        ambient(),
        Arc::new(RunHistory::new(log)),
        registry,
    )
}

fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Waits until two runs are inside the job logic at once, then records what
/// each run observed.
struct ObservingProcessor {
    barrier: Barrier,
    seen: Mutex<HashMap<String, TaskRunContext>>,
}

#[async_trait]
impl TaskRunProcessor for ObservingProcessor {
    fn name(&self) -> &str {
        "observing"
    }

    async fn process_task_run(&self, context: &mut TaskRunContext) {
        self.barrier.wait().await;
        let query_id = context
            .ctx
            .query_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        self.seen.lock().await.insert(query_id, context.clone());
        context.ctx.state.set_ok(0);
    }
}

#[tokio::test]
async fn concurrent_runs_are_isolated_from_each_other_and_the_ambient_context() {
    let processor = Arc::new(ObservingProcessor {
        barrier: Barrier::new(2),
        seen: Mutex::new(HashMap::new()),
    });
    let dispatcher = dispatcher_with(2, JobKind::Statistics, processor.clone()).await;
    dispatcher.start().await;

    let task = Arc::new(Task::new(1, "t", "db1", "ANALYZE TABLE x", JobKind::Statistics));
    let two = dispatcher
        .create_run(task.clone(), props(&[("query_timeout", "2"), ("sample_ratio", "0.1")]))
        .await
        .unwrap();
    let three = dispatcher
        .create_run(task, props(&[("query_timeout", "3")]))
        .await
        .unwrap();
    let two = dispatcher.submit(two).await.unwrap();
    let three = dispatcher.submit(three).await.unwrap();
    let (two_id, three_id) = (two.query_id().to_string(), three.query_id().to_string());

    let two_status = tokio::time::timeout(Duration::from_secs(10), two.wait())
        .await
        .unwrap()
        .unwrap();
    let three_status = three.wait().await.unwrap();
    assert_eq!(two_status.state(), RunState::Success);
    assert_eq!(three_status.state(), RunState::Success);

    let seen = processor.seen.lock().await;
    let two_ctx = &seen[&two_id];
    let three_ctx = &seen[&three_id];
    assert_eq!(two_ctx.ctx.session_variables.query_timeout, 2);
    assert_eq!(three_ctx.ctx.session_variables.query_timeout, 3);
    assert_eq!(two_ctx.properties, props(&[("sample_ratio", "0.1")]));
    assert!(three_ctx.properties.is_empty());
    assert_eq!(two_ctx.definition, "ANALYZE TABLE x");
    assert_eq!(two_ctx.remote_ip, "10.0.0.7:50123");
    assert!(!two_ctx.ctx.state.is_error());

    assert_eq!(dispatcher.ambient().session_variables.query_timeout, 1);
    assert!(dispatcher.ambient().query_id.is_none());
    dispatcher.shutdown().await;
}

/// Fails every statement that mentions a missing table.
struct MissingTableExecutor;

#[async_trait]
impl StatementExecutor for MissingTableExecutor {
    async fn execute(&self, _ctx: &SessionContext, statement: &str) -> Result<u64, StatementError> {
        if statement.contains("missing") {
            Err(StatementError::with_code("table not found", 5000))
        } else {
            Ok(1)
        }
    }
}

#[tokio::test]
async fn job_failure_is_captured_in_the_status() {
    let processor = Arc::new(SqlTaskProcessor::new("sql", Arc::new(MissingTableExecutor)));
    let dispatcher = dispatcher_with(1, JobKind::Sql, processor).await;
    dispatcher.start().await;

    let task = Arc::new(Task::new(1, "t", "db1", "ANALYZE TABLE missing", JobKind::Sql));
    let run = dispatcher.create_run(task, BTreeMap::new()).await.unwrap();
    let handle = dispatcher.submit(run).await.unwrap();
    let query_id = handle.query_id().to_string();
    let status = handle.wait().await.unwrap();

    assert_eq!(status.state(), RunState::Failed);
    assert_eq!(status.error_code(), 5000);
    assert_eq!(status.error_message(), Some("table not found"));
    assert!(status.finish_time().unwrap() >= status.create_time());
    assert_eq!(dispatcher.status(&query_id).await.unwrap().error_code(), 5000);
    dispatcher.shutdown().await;
}

/// Records the order runs reach the job logic.
#[derive(Default)]
struct OrderProcessor {
    order: Mutex<Vec<i32>>,
}

#[async_trait]
impl TaskRunProcessor for OrderProcessor {
    fn name(&self) -> &str {
        "order"
    }

    async fn process_task_run(&self, context: &mut TaskRunContext) {
        let label = context
            .properties
            .get("label")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        self.order.lock().await.push(label);
        context.ctx.state.set_ok(0);
    }
}

#[tokio::test]
async fn dequeue_follows_priority_then_submission_order() {
    let processor = Arc::new(OrderProcessor::default());
    let dispatcher = dispatcher_with(1, JobKind::Statistics, processor.clone()).await;
    let task = Arc::new(Task::new(1, "t", "db1", "ANALYZE TABLE x", JobKind::Statistics));

    let mut handles = Vec::new();
    for (label, priority) in [(1, 5), (2, 5), (3, 10)] {
        let mut run = dispatcher
            .create_run(task.clone(), props(&[("label", &label.to_string())]))
            .await
            .unwrap();
        run.status_mut().unwrap().set_priority(priority);
        handles.push(dispatcher.submit(run).await.unwrap());
    }

    dispatcher.start().await;
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap().state(), RunState::Success);
    }
    // The priority-10 run first, then the two priority-5 runs oldest first.
    assert_eq!(*processor.order.lock().await, vec![3, 1, 2]);
    dispatcher.shutdown().await;
}

struct BlockingProcessor;

#[async_trait]
impl TaskRunProcessor for BlockingProcessor {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn process_task_run(&self, _context: &mut TaskRunContext) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn cancelling_a_running_run_reaches_a_terminal_state() {
    let dispatcher = dispatcher_with(1, JobKind::MvRefresh, Arc::new(BlockingProcessor)).await;
    dispatcher.start().await;

    let task = Arc::new(Task::new(1, "mv", "db1", "REFRESH MATERIALIZED VIEW mv", JobKind::MvRefresh));
    let run = dispatcher.create_run(task, BTreeMap::new()).await.unwrap();
    let handle = dispatcher.submit(run).await.unwrap();
    let query_id = handle.query_id().to_string();

    for _ in 0..200 {
        if dispatcher.status(&query_id).await.map(|s| s.state()) == Some(RunState::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();
    assert!(handle.is_cancelled());

    let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state(), RunState::Failed);
    assert_eq!(status.error_code(), ERR_CANCELLED);
    assert!(status.finish_time().is_some());
    dispatcher.shutdown().await;
}

struct Succeed;

#[async_trait]
impl TaskRunProcessor for Succeed {
    fn name(&self) -> &str {
        "succeed"
    }

    async fn process_task_run(&self, context: &mut TaskRunContext) {
        context.ctx.state.set_ok(0);
    }
}

#[tokio::test]
async fn restart_recovers_history_and_fails_interrupted_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.db");
    let task = Arc::new(Task::new(1, "t", "db1", "ANALYZE TABLE x", JobKind::Statistics));

    let (done_id, queued_id) = {
        let log = Arc::new(LibSqlStatusLog::new_local(&path).await.unwrap());
        let registry = Arc::new(ProcessorRegistry::new());
        registry.register(JobKind::Statistics, Arc::new(Succeed)).await;
        let dispatcher = Dispatcher::new(
            config(1),
            ambient(),
            Arc::new(RunHistory::new(log)),
            registry,
        );

        dispatcher.start().await;
        let run = dispatcher.create_run(task.clone(), BTreeMap::new()).await.unwrap();
        let done = dispatcher.submit(run).await.unwrap();
        let done_id = done.query_id().to_string();
        assert_eq!(done.wait().await.unwrap().state(), RunState::Success);
        dispatcher.shutdown().await;

        // Queued after the workers stopped: only its PENDING record exists.
        let fresh = Dispatcher::new(
            config(1),
            ambient(),
            dispatcher.history().clone(),
            Arc::new(ProcessorRegistry::new()),
        );
        let mut run = task_run_for(&task);
        run.init_status(uuid::Uuid::new_v4().to_string(), None, 3600)
            .unwrap();
        let queued = fresh.submit(run).await.unwrap();
        (done_id, queued.query_id().to_string())
    };

    let log = Arc::new(LibSqlStatusLog::new_local(&path).await.unwrap());
    let history = RunHistory::new(log);
    let report = history.recover().await.unwrap();
    assert_eq!(report.recovered, 2);
    assert_eq!(report.interrupted, vec![queued_id.clone()]);
    assert!(report.quarantined.is_empty());

    let done = history.get(&done_id).await.unwrap();
    assert_eq!(done.state(), RunState::Success);
    assert_eq!(done.task_name(), "t");
    let interrupted = history.get(&queued_id).await.unwrap();
    assert_eq!(interrupted.state(), RunState::Failed);
    assert_eq!(interrupted.error_code(), ERR_INTERRUPTED);
    assert!(interrupted.finish_time().is_some());
}

/// Stalls the append of a re-prioritized PENDING record.
struct SlowPriorityLog {
    inner: LibSqlStatusLog,
    priority: i32,
}

#[async_trait]
impl StatusLog for SlowPriorityLog {
    async fn append(&self, status: &RunStatus) -> Result<u64, DatabaseError> {
        if status.state() == RunState::Pending && status.priority() == self.priority {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.inner.append(status).await
    }

    async fn replay(&self) -> Result<Vec<LogEntry>, DatabaseError> {
        self.inner.replay().await
    }

    async fn quarantine(&self, seq: u64, reason: &str) -> Result<(), DatabaseError> {
        self.inner.quarantine(seq, reason).await
    }

    async fn purge(&self, query_ids: &[String]) -> Result<u64, DatabaseError> {
        self.inner.purge(query_ids).await
    }
}

#[tokio::test]
async fn priority_change_racing_a_worker_never_rewinds_a_finished_run() {
    let log = Arc::new(SlowPriorityLog {
        inner: LibSqlStatusLog::new_memory().await.unwrap(),
        priority: 7,
    });
    let registry = Arc::new(ProcessorRegistry::new());
    registry.register(JobKind::Statistics, Arc::new(Succeed)).await;
    let dispatcher = Dispatcher::new(
        config(1),
        ambient(),
        Arc::new(RunHistory::new(log.clone())),
        registry,
    );

    let task = Arc::new(Task::new(1, "t", "db1", "ANALYZE TABLE x", JobKind::Statistics));
    let run = dispatcher.create_run(task, BTreeMap::new()).await.unwrap();
    let handle = dispatcher.submit(run).await.unwrap();
    let query_id = handle.query_id().to_string();

    // The worker starts while the PENDING priority-7 record is still being written.
    let (updated, ()) = tokio::join!(dispatcher.set_priority(&query_id, 7), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.start().await;
    });
    assert_eq!(updated.unwrap().priority(), 7);

    let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state(), RunState::Success);
    assert_eq!(status.priority(), 7);
    assert_eq!(
        dispatcher.status(&query_id).await.unwrap().state(),
        RunState::Success
    );
    dispatcher.shutdown().await;

    let history = RunHistory::new(log);
    let report = history.recover().await.unwrap();
    assert!(report.interrupted.is_empty());
    let recovered = history.get(&query_id).await.unwrap();
    assert_eq!(recovered.state(), RunState::Success);
    assert_ne!(recovered.error_code(), ERR_INTERRUPTED);
}

fn task_run_for(task: &Arc<Task>) -> task_scheduler::run::TaskRun {
    task_scheduler::run::TaskRun::new(task.clone(), BTreeMap::new(), Arc::new(Succeed))
}
