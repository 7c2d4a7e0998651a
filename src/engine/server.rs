//! Execution nodes: the `Server` contract and the in-process implementation

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::config::SchedulerConfig;
use super::queue::TaskQueues;
use super::task::SharedTask;
use crate::utils::error::{ServerError, TaskError};

/// Default time box for one task attempt (and again for its cleanup).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Contract shared by local and remote execution nodes.
#[async_trait]
pub trait Server: Send + Sync + fmt::Debug {
    /// Name the scheduler reports completed tasks under
    fn name(&self) -> &str;

    /// Queue a task in the lane matching its priority.
    async fn add_task(&self, task: SharedTask) -> Result<(), ServerError>;

    /// Drain every queue in priority order, running each task under the
    /// time box. Returns the tasks that completed, in execution order.
    async fn execute_tasks(&self) -> Result<Vec<SharedTask>, ServerError>;

    /// Tasks that did not complete during the most recent batch.
    async fn failed_tasks(&self) -> Result<Vec<SharedTask>, ServerError>;

    async fn stats(&self) -> Result<ServerStats, ServerError>;

    /// Empty every queue, returning what was waiting.
    async fn remove_all_tasks(&self) -> Result<Vec<SharedTask>, ServerError>;

    async fn is_online(&self) -> bool;

    /// Independent copy used by the scheduler so that registration never
    /// mutates the caller's instance.
    fn duplicate(&self) -> Arc<dyn Server>;
}

/// Immutable statistics snapshot consumed by external reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub tasks_attempted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_time: Duration,
}

/// Tracks attempts on one server. Only one attempt may be open at a time.
#[derive(Debug, Default, Clone)]
pub struct ServerMonitor {
    stats: ServerStats,
    attempt_started: Option<Instant>,
}

impl ServerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an attempt. Fails if the previous one was never recorded.
    pub fn task_started(&mut self, server: &str) -> Result<(), ServerError> {
        if self.attempt_started.is_some() {
            return Err(ServerError::OverlappingAttempt {
                server: server.to_string(),
            });
        }
        self.attempt_started = Some(Instant::now());
        Ok(())
    }

    /// Close the open attempt and fold it into the totals.
    pub fn record_task(&mut self, completed: bool) -> Duration {
        let elapsed = self
            .attempt_started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();

        self.stats.tasks_attempted += 1;
        if completed {
            self.stats.tasks_completed += 1;
        } else {
            self.stats.tasks_failed += 1;
        }
        self.stats.total_execution_time += elapsed;
        elapsed
    }

    pub fn reset(&mut self) {
        self.stats = ServerStats::default();
    }

    pub fn snapshot(&self) -> ServerStats {
        self.stats
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process execution node.
pub struct LocalServer {
    name: String,
    timeout: Duration,
    queues: Mutex<TaskQueues>,
    failed: Mutex<Vec<SharedTask>>,
    monitor: Mutex<ServerMonitor>,
    // one batch at a time; appends never wait on it
    batch: tokio::sync::Mutex<()>,
}

impl fmt::Debug for LocalServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalServer")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("queued", &self.queued())
            .finish()
    }
}

impl LocalServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timeout(name, DEFAULT_TASK_TIMEOUT)
    }

    pub fn with_timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            queues: Mutex::new(TaskQueues::new()),
            failed: Mutex::new(Vec::new()),
            monitor: Mutex::new(ServerMonitor::new()),
            batch: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &SchedulerConfig) -> Self {
        Self::with_timeout(name, config.task_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of tasks waiting for the next batch
    pub fn queued(&self) -> usize {
        lock(&self.queues).len()
    }

    /// Ids of waiting tasks in execution order
    pub fn queued_ids(&self) -> Vec<String> {
        lock(&self.queues)
            .iter_in_order()
            .map(|t| t.id().to_string())
            .collect()
    }

    /// Run one attempt under the time box, cleaning up if it is abandoned.
    /// A panicking task counts as a failed attempt.
    async fn run_attempt(&self, task: &SharedTask) {
        let attempt = AssertUnwindSafe(task.execute()).catch_unwind();
        let outcome = match timeout(self.timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            Err(_) => Err(TaskError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(()) => {
                debug!(server = %self.name, task_id = %task.id(), "task attempt finished");
            }
            Err(e) => {
                warn!(server = %self.name, task_id = %task.id(), error = %e, "task attempt failed");
                self.run_cleanup(task).await;
            }
        }
    }

    async fn run_cleanup(&self, task: &SharedTask) {
        let cleanup = AssertUnwindSafe(task.cleanup()).catch_unwind();
        match timeout(self.timeout, cleanup).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(server = %self.name, task_id = %task.id(), error = %e, "task cleanup failed");
            }
            Ok(Err(payload)) => {
                error!(
                    server = %self.name,
                    task_id = %task.id(),
                    panic = %panic_message(payload.as_ref()),
                    "task cleanup panicked"
                );
            }
            Err(_) => {
                error!(server = %self.name, task_id = %task.id(), "task cleanup timed out");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Server for LocalServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_task(&self, task: SharedTask) -> Result<(), ServerError> {
        debug!(server = %self.name, task_id = %task.id(), priority = %task.priority(), "task queued");
        lock(&self.queues).push(task);
        Ok(())
    }

    async fn execute_tasks(&self) -> Result<Vec<SharedTask>, ServerError> {
        let _batch = self.batch.lock().await;
        lock(&self.failed).clear();

        let tasks = lock(&self.queues).take_all();
        info!(server = %self.name, tasks = tasks.len(), "server batch started");

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut pending = tasks.into_iter();

        while let Some(task) = pending.next() {
            let started = lock(&self.monitor).task_started(&self.name);
            if let Err(e) = started {
                error!(server = %self.name, task_id = %task.id(), "attempt overlap detected, aborting batch");
                failed.push(task);
                failed.extend(pending);
                lock(&self.failed).extend(failed);
                return Err(e);
            }

            self.run_attempt(&task).await;

            let done = task.is_completed();
            let elapsed = lock(&self.monitor).record_task(done);
            histogram!("taskgrid.server.task_execution_time_ms", elapsed.as_secs_f64() * 1000.0);

            if done {
                counter!("taskgrid.server.tasks_completed_total", 1);
                completed.push(task);
            } else {
                counter!("taskgrid.server.tasks_failed_total", 1);
                failed.push(task);
            }
        }

        info!(
            server = %self.name,
            completed = completed.len(),
            failed = failed.len(),
            "server batch finished"
        );
        *lock(&self.failed) = failed;
        Ok(completed)
    }

    async fn failed_tasks(&self) -> Result<Vec<SharedTask>, ServerError> {
        Ok(lock(&self.failed).clone())
    }

    async fn stats(&self) -> Result<ServerStats, ServerError> {
        Ok(lock(&self.monitor).snapshot())
    }

    async fn remove_all_tasks(&self) -> Result<Vec<SharedTask>, ServerError> {
        let removed = lock(&self.queues).take_all();
        if !removed.is_empty() {
            info!(server = %self.name, removed = removed.len(), "queues flushed");
        }
        Ok(removed)
    }

    async fn is_online(&self) -> bool {
        true
    }

    fn duplicate(&self) -> Arc<dyn Server> {
        let copy = LocalServer::with_timeout(self.name.clone(), self.timeout);
        *lock(&copy.queues) = lock(&self.queues).clone();
        Arc::new(copy)
    }
}
