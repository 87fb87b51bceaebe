//! Priority run queue.
//!
//! Runs are kept unsorted and the best one is picked at dequeue time, so a
//! priority change on a queued run takes effect without reordering anything.
//! Dequeue order: higher priority, then earlier creation time, then earlier
//! submission.
//!
//! Runs claimed through `next_for` stay known to the queue by their
//! cancellation token until `release`, so `cancel` finds a run whether it is
//! still queued or already executing.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use crate::error::{QueueError, RunError};
use crate::run::state::{ERR_CANCELLED, ERR_CONTEXT_ISOLATION};
use crate::run::{CancellationToken, IsolatedContext, RunState, RunStatus, SessionContext, TaskRun};

/// Outcome of claiming a run with `RunQueue::next_for`.
#[derive(Debug)]
pub enum Dequeued {
    /// Isolated and `RUNNING`; ready to execute.
    Admitted(TaskRun, IsolatedContext),
    /// Failed without running: isolation failed or the run was cancelled
    /// while queued.
    Rejected(TaskRun, RunError),
}

/// Outcome of `RunQueue::cancel`.
#[derive(Debug)]
pub enum Cancellation {
    /// Removed from the queue and failed as cancelled.
    Queued(TaskRun),
    /// Already claimed; its token has been cancelled.
    Running,
}

struct Entry {
    seq: u64,
    run: TaskRun,
}

impl Entry {
    fn key(&self) -> (Reverse<i32>, i64, u64) {
        (Reverse(self.run.priority()), self.run.create_time(), self.seq)
    }

    fn query_id(&self) -> &str {
        self.run.query_id().unwrap_or_default()
    }
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    running: HashMap<String, CancellationToken>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn take_best(&mut self) -> Option<TaskRun> {
        let (idx, _) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.key())?;
        Some(self.entries.swap_remove(idx).run)
    }

    fn position(&self, query_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.query_id() == query_id)
    }
}

/// Bounded queue of `PENDING` runs shared by the dispatcher's workers.
pub struct RunQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl RunQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a `PENDING` run.
    pub async fn submit(&self, run: TaskRun) -> Result<(), QueueError> {
        let status = run.status().ok_or_else(|| RunError::MissingStatus {
            query_id: run.task().name.clone(),
        })?;
        if status.state() != RunState::Pending {
            return Err(QueueError::NotPending {
                query_id: status.query_id().to_string(),
                state: status.state().to_string(),
            });
        }
        let query_id = status.query_id().to_string();

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.entries.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        if state.position(&query_id).is_some() || state.running.contains_key(&query_id) {
            return Err(QueueError::Duplicate { query_id });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry { seq, run });
        drop(state);

        tracing::debug!(query_id = %query_id, seq, "Run queued");
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the best queued run and claim it as `RUNNING`.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<TaskRun> {
        self.claim(|mut run, _| {
            if let Some(status) = run.status_mut()
                && let Err(e) = status.mark_running()
            {
                tracing::warn!(error = %e, "Dequeued run could not start");
            }
            run
        })
        .await
    }

    /// Wait for the best queued run, isolate it from `ambient` and claim it.
    ///
    /// Isolation happens in the same step as removal, so a run that cannot be
    /// isolated goes straight from `PENDING` to `FAILED`. An admitted run is
    /// registered as running until `release`.
    pub async fn next_for(&self, ambient: &SessionContext) -> Option<Dequeued> {
        self.claim(|mut run, state| match admit(&mut run, ambient) {
            Ok(ctx) => {
                if let (Some(query_id), Some(token)) = (run.query_id(), run.token()) {
                    state.running.insert(query_id.to_string(), token.clone());
                }
                Dequeued::Admitted(run, ctx)
            }
            Err(e) => Dequeued::Rejected(run, e),
        })
        .await
    }

    /// Forget a run claimed by `next_for` once it has finished.
    pub async fn release(&self, query_id: &str) {
        self.state.lock().await.running.remove(query_id);
    }

    pub async fn is_running(&self, query_id: &str) -> bool {
        self.state.lock().await.running.contains_key(query_id)
    }

    async fn claim<T>(
        &self,
        mut on_claim: impl FnMut(TaskRun, &mut QueueState) -> T,
    ) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if let Some(run) = state.take_best() {
                    let claimed = on_claim(run, &mut *state);
                    if !state.entries.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(claimed);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Change the priority of a queued run. Returns the updated status.
    pub async fn set_priority(&self, query_id: &str, priority: i32) -> Result<RunStatus, QueueError> {
        self.set_priority_with(query_id, priority, |_| async {}).await
    }

    /// Change the priority of a queued run and hand the updated status to
    /// `on_change` before the run can be claimed.
    pub async fn set_priority_with<F, Fut>(
        &self,
        query_id: &str,
        priority: i32,
        on_change: F,
    ) -> Result<RunStatus, QueueError>
    where
        F: FnOnce(RunStatus) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut state = self.state.lock().await;
        let idx = state.position(query_id).ok_or_else(|| QueueError::NotQueued {
            query_id: query_id.to_string(),
        })?;
        let status = state.entries[idx]
            .run
            .status_mut()
            .ok_or_else(|| RunError::MissingStatus {
                query_id: query_id.to_string(),
            })?;
        status.set_priority(priority);
        let updated = status.clone();
        tracing::info!(query_id = %query_id, priority, "Run priority changed");

        // The queue stays locked: no worker can claim and finish the run
        // before the change is recorded.
        on_change(updated.clone()).await;
        drop(state);
        Ok(updated)
    }

    /// Cancel a run. A queued run is removed and failed as cancelled; a
    /// claimed run has its token cancelled and is failed by its executor.
    pub async fn cancel(&self, query_id: &str) -> Result<Cancellation, QueueError> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(query_id) else {
            return match state.running.get(query_id) {
                Some(token) => {
                    token.cancel();
                    tracing::info!(query_id = %query_id, "Running run cancelled");
                    Ok(Cancellation::Running)
                }
                None => Err(QueueError::NotQueued {
                    query_id: query_id.to_string(),
                }),
            };
        };
        let mut run = state.entries.swap_remove(idx).run;
        drop(state);

        if let Some(token) = run.token() {
            token.cancel();
        }
        run.fail(ERR_CANCELLED, "task run was cancelled before it started")?;
        tracing::info!(query_id = %query_id, "Queued run cancelled");
        Ok(Cancellation::Queued(run))
    }

    /// Stop accepting runs and wake every waiter. Queued runs are still
    /// handed out until the queue is drained.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    pub async fn contains(&self, query_id: &str) -> bool {
        self.state.lock().await.position(query_id).is_some()
    }

    /// Statuses of queued runs, in the order they would be dequeued now.
    pub async fn pending(&self) -> Vec<RunStatus> {
        let state = self.state.lock().await;
        let mut entries: Vec<&Entry> = state.entries.iter().collect();
        entries.sort_by_key(|e| e.key());
        entries
            .into_iter()
            .filter_map(|e| e.run.status().cloned())
            .collect()
    }
}

fn admit(run: &mut TaskRun, ambient: &SessionContext) -> Result<IsolatedContext, RunError> {
    if run.is_cancelled() {
        run.fail(ERR_CANCELLED, "task run was cancelled before it started")?;
        return Err(RunError::Cancelled {
            query_id: run.query_id().unwrap_or_default().to_string(),
        });
    }
    match run.isolate(ambient) {
        Ok(ctx) => {
            if let Some(status) = run.status_mut() {
                status.mark_running()?;
            }
            Ok(ctx)
        }
        Err(e) => {
            let now = Utc::now().timestamp_millis();
            if let Some(status) = run.status_mut() {
                status.mark_failed(ERR_CONTEXT_ISOLATION, e.to_string(), now)?;
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::processor::{TaskRunContext, TaskRunProcessor};
    use crate::run::{InMemoryStateManager, UserIdentity, handle_pair};
    use crate::task::{JobKind, Task};

    struct Noop;

    #[async_trait]
    impl TaskRunProcessor for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn process_task_run(&self, _context: &mut TaskRunContext) {}
    }

    fn run(priority: i32, create_time: i64) -> TaskRun {
        run_in("db1", priority, create_time)
    }

    fn run_in(db: &str, priority: i32, create_time: i64) -> TaskRun {
        let task = Arc::new(Task::new(1, "t", db, "ANALYZE TABLE x", JobKind::Statistics));
        let mut run = TaskRun::new(task, BTreeMap::new(), Arc::new(Noop));
        run.init_status(uuid::Uuid::new_v4().to_string(), Some(create_time), 60)
            .unwrap();
        run.status_mut().unwrap().set_priority(priority);
        run
    }

    fn ambient() -> SessionContext {
        SessionContext::new(
            "default_cluster",
            UserIdentity::new("root", "%"),
            Arc::new(InMemoryStateManager::new(["db1"])),
        )
    }

    #[tokio::test]
    async fn tie_break_dequeue_order() {
        let queue = RunQueue::new(10);
        // Same creation time: submission order breaks the tie.
        let first = run(5, 100);
        let second = run(5, 100);
        let urgent = run(10, 100);
        let ids: Vec<String> = [&first, &second, &urgent]
            .iter()
            .map(|r| r.query_id().unwrap().to_string())
            .collect();
        queue.submit(first).await.unwrap();
        queue.submit(second).await.unwrap();
        queue.submit(urgent).await.unwrap();

        let order: Vec<String> = vec![
            queue.next().await.unwrap(),
            queue.next().await.unwrap(),
            queue.next().await.unwrap(),
        ]
        .iter()
        .map(|r| r.query_id().unwrap().to_string())
        .collect();
        assert_eq!(order, vec![ids[2].clone(), ids[0].clone(), ids[1].clone()]);
    }

    #[tokio::test]
    async fn earlier_creation_wins_among_equal_priority() {
        let queue = RunQueue::new(10);
        queue.submit(run(1, 20)).await.unwrap();
        queue.submit(run(1, 10)).await.unwrap();
        assert_eq!(queue.next().await.unwrap().create_time(), 10);
    }

    #[tokio::test]
    async fn next_claims_as_running() {
        let queue = RunQueue::new(10);
        queue.submit(run(0, 1)).await.unwrap();
        let claimed = queue.next().await.unwrap();
        assert_eq!(claimed.status().unwrap().state(), RunState::Running);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn priority_is_read_at_dequeue_time() {
        let queue = RunQueue::new(10);
        let low = run(1, 1);
        let low_id = low.query_id().unwrap().to_string();
        queue.submit(low).await.unwrap();
        queue.submit(run(5, 2)).await.unwrap();

        let updated = queue.set_priority(&low_id, 9).await.unwrap();
        assert_eq!(updated.priority(), 9);
        assert_eq!(queue.pending().await[0].query_id(), low_id);
        assert_eq!(queue.next().await.unwrap().query_id().unwrap(), low_id);

        assert!(matches!(
            queue.set_priority("missing", 1).await,
            Err(QueueError::NotQueued { .. })
        ));
    }

    fn with_id(query_id: &str) -> TaskRun {
        let task = Arc::new(Task::new(1, "t", "db1", "ANALYZE TABLE x", JobKind::Statistics));
        let mut run = TaskRun::new(task, BTreeMap::new(), Arc::new(Noop));
        run.init_status(query_id, Some(1), 60).unwrap();
        run
    }

    #[tokio::test]
    async fn rejects_when_full() {
        let queue = RunQueue::new(1);
        queue.submit(run(0, 1)).await.unwrap();
        assert!(matches!(
            queue.submit(run(0, 2)).await,
            Err(QueueError::Full { capacity: 1 })
        ));
    }

    #[tokio::test]
    async fn rejects_duplicate_query_id() {
        let queue = RunQueue::new(5);
        let id = uuid::Uuid::new_v4().to_string();
        queue.submit(with_id(&id)).await.unwrap();
        assert!(matches!(
            queue.submit(with_id(&id)).await,
            Err(QueueError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_runs_that_are_not_pending() {
        let queue = RunQueue::new(5);
        let mut running = run(0, 3);
        running.status_mut().unwrap().mark_running().unwrap();
        assert!(matches!(
            queue.submit(running).await,
            Err(QueueError::NotPending { .. })
        ));

        let task = Arc::new(Task::new(2, "u", "db1", "SELECT 1", JobKind::Sql));
        let bare = TaskRun::new(task, BTreeMap::new(), Arc::new(Noop));
        assert!(matches!(
            queue.submit(bare).await,
            Err(QueueError::Run(RunError::MissingStatus { .. }))
        ));
    }

    #[tokio::test]
    async fn next_for_isolates_or_rejects() {
        let queue = RunQueue::new(10);
        queue.submit(run_in("db1", 1, 1)).await.unwrap();
        queue.submit(run_in("nope", 0, 2)).await.unwrap();
        let ambient = ambient();

        match queue.next_for(&ambient).await.unwrap() {
            Dequeued::Admitted(run, ctx) => {
                assert_eq!(run.status().unwrap().state(), RunState::Running);
                assert_eq!(ctx.session.database, "db1");
            }
            Dequeued::Rejected(_, e) => panic!("unexpected rejection: {e}"),
        }
        match queue.next_for(&ambient).await.unwrap() {
            Dequeued::Rejected(run, RunError::ContextIsolation { .. }) => {
                let status = run.status().unwrap();
                assert_eq!(status.state(), RunState::Failed);
                assert_eq!(status.error_code(), ERR_CONTEXT_ISOLATION);
            }
            other => panic!("expected isolation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_rejects_at_dequeue() {
        let queue = RunQueue::new(10);
        let mut queued = run(0, 1);
        let (exec, handle) = handle_pair(queued.query_id().unwrap());
        queued.attach_handle(exec);
        queue.submit(queued).await.unwrap();
        handle.cancel();

        match queue.next_for(&ambient()).await.unwrap() {
            Dequeued::Rejected(run, RunError::Cancelled { .. }) => {
                assert_eq!(run.status().unwrap().error_code(), ERR_CANCELLED);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_removes_queued_run() {
        let queue = RunQueue::new(10);
        let queued = run(0, 1);
        let id = queued.query_id().unwrap().to_string();
        queue.submit(queued).await.unwrap();

        let Cancellation::Queued(cancelled) = queue.cancel(&id).await.unwrap() else {
            panic!("expected a queued cancellation");
        };
        let status = cancelled.status().unwrap();
        assert_eq!(status.state(), RunState::Failed);
        assert_eq!(status.error_code(), ERR_CANCELLED);
        assert!(status.finish_time().is_some());
        assert!(queue.is_empty().await);
        assert!(matches!(queue.cancel(&id).await, Err(QueueError::NotQueued { .. })));
    }

    #[tokio::test]
    async fn cancel_reaches_a_claimed_run() {
        let queue = RunQueue::new(10);
        let mut queued = run(0, 1);
        let id = queued.query_id().unwrap().to_string();
        let (exec, handle) = handle_pair(&id);
        queued.attach_handle(exec);
        queue.submit(queued).await.unwrap();

        let Dequeued::Admitted(claimed, _) = queue.next_for(&ambient()).await.unwrap() else {
            panic!("expected admission");
        };
        assert!(queue.is_running(&id).await);
        assert!(matches!(
            queue.cancel(&id).await,
            Ok(Cancellation::Running)
        ));
        assert!(handle.is_cancelled());
        assert!(claimed.is_cancelled());

        queue.release(&id).await;
        assert!(!queue.is_running(&id).await);
        assert!(matches!(queue.cancel(&id).await, Err(QueueError::NotQueued { .. })));
    }

    #[tokio::test]
    async fn claimed_query_id_cannot_be_resubmitted() {
        let queue = RunQueue::new(10);
        let id = uuid::Uuid::new_v4().to_string();
        let mut first = with_id(&id);
        let (exec, _handle) = handle_pair(&id);
        first.attach_handle(exec);
        queue.submit(first).await.unwrap();
        assert!(matches!(
            queue.next_for(&ambient()).await,
            Some(Dequeued::Admitted(..))
        ));
        assert!(matches!(
            queue.submit(with_id(&id)).await,
            Err(QueueError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn run_cannot_be_claimed_while_priority_change_is_recorded() {
        let queue = Arc::new(RunQueue::new(10));
        let queued = run(0, 1);
        let id = queued.query_id().unwrap().to_string();
        queue.submit(queued).await.unwrap();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let changer = {
            let queue = queue.clone();
            let id = id.clone();
            tokio::spawn(async move {
                queue
                    .set_priority_with(&id, 7, |status| async move {
                        let _ = started_tx.send(status.priority());
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        assert_eq!(started_rx.await.unwrap(), 7);

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(changer.await.unwrap().unwrap().priority(), 7);
        let claimed = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed.priority(), 7);
    }

    #[tokio::test]
    async fn blocked_next_wakes_on_submit() {
        let queue = Arc::new(RunQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.submit(run(0, 1)).await.unwrap();
        let claimed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn concurrent_consumers_never_share_a_run() {
        let queue = Arc::new(RunQueue::new(100));
        for i in 0..50 {
            queue.submit(run(i % 3, i as i64)).await.unwrap();
        }
        queue.close().await;

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(run) = queue.next().await {
                    ids.push(run.query_id().unwrap().to_string());
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_refuses_submits() {
        let queue = Arc::new(RunQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(queue.is_closed().await);
        assert!(matches!(queue.submit(run(0, 1)).await, Err(QueueError::Closed)));
    }
}
