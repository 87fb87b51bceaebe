//! In-memory task catalog and the cron ticker that fires periodic tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::TaskError;
use crate::scheduler::Dispatcher;
use crate::task::{JobKind, Task, TaskSchedule};

struct CatalogEntry {
    task: Arc<Task>,
    next_fire: Option<DateTime<Utc>>,
}

/// Tasks by name.
pub struct TaskCatalog {
    tasks: RwLock<HashMap<String, CatalogEntry>>,
    next_id: AtomicU64,
}

impl TaskCatalog {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Define a manually scheduled task.
    pub async fn create(
        &self,
        name: &str,
        db_name: &str,
        kind: JobKind,
        definition: &str,
    ) -> Result<Arc<Task>, TaskError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(name) {
            return Err(TaskError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Task::new(id, name, db_name, definition, kind));
        tasks.insert(
            name.to_string(),
            CatalogEntry {
                task: task.clone(),
                next_fire: None,
            },
        );
        tracing::info!(task = %name, id, kind = %kind, "Task created");
        Ok(task)
    }

    /// Replace a task's schedule. Runs already created keep the old task.
    pub async fn set_schedule(
        &self,
        name: &str,
        schedule: TaskSchedule,
    ) -> Result<Arc<Task>, TaskError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks.get_mut(name).ok_or_else(|| TaskError::NotFound {
            name: name.to_string(),
        })?;
        let task = Arc::new(entry.task.as_ref().clone().with_schedule(schedule));
        entry.next_fire = task.schedule.next_fire_time();
        entry.task = task.clone();
        tracing::info!(
            task = %name,
            schedule = task.schedule.schedule_type(),
            next_fire = ?entry.next_fire,
            "Task schedule changed"
        );
        Ok(task)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Task>, TaskError> {
        self.tasks
            .read()
            .await
            .get(name)
            .map(|e| e.task.clone())
            .ok_or_else(|| TaskError::NotFound {
                name: name.to_string(),
            })
    }

    /// Find the task a run status belongs to.
    pub async fn find(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.read().await.get(name).map(|e| e.task.clone())
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = self
            .tasks
            .read()
            .await
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub async fn remove(&self, name: &str) -> Result<Arc<Task>, TaskError> {
        self.tasks
            .write()
            .await
            .remove(name)
            .map(|e| e.task)
            .ok_or_else(|| TaskError::NotFound {
                name: name.to_string(),
            })
    }

    /// Periodic tasks due at `now`. Each returned task's next fire time is
    /// moved past `now`, so a task fires at most once per call.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<Arc<Task>> {
        let mut due = Vec::new();
        for entry in self.tasks.write().await.values_mut() {
            if let Some(at) = entry.next_fire
                && at <= now
            {
                due.push(entry.task.clone());
                entry.next_fire = entry.task.schedule.next_fire_after(now);
            }
        }
        due.sort_by_key(|t| t.id);
        due
    }
}

impl Default for TaskCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background task that submits runs of due periodic tasks.
pub fn spawn_cron_ticker(
    catalog: Arc<TaskCatalog>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for task in catalog.due(Utc::now()).await {
                let name = task.name.clone();
                let run = match dispatcher.create_run(task, BTreeMap::new()).await {
                    Ok(run) => run,
                    Err(e) => {
                        tracing::warn!(task = %name, error = %e, "Could not create scheduled run");
                        continue;
                    }
                };
                match dispatcher.submit(run).await {
                    Ok(handle) => {
                        tracing::info!(task = %name, query_id = %handle.query_id(), "Scheduled run submitted")
                    }
                    Err(e) => tracing::warn!(task = %name, error = %e, "Scheduled run rejected"),
                }
            }
        }
    })
}
