use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::config::SchedulerConfig;
use super::queue::TaskPriority;
use super::retry::{RetryDecision, RetryPolicy, RetryQueue};
use super::server::{Server, ServerStats};
use super::task::SharedTask;
use crate::utils::error::{SchedulerError, SchedulerResult, TaskError};

/// Expected backlog of one server within one priority lane.
/// Ordered by wait, then by registration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ServerWait {
    expected_wait: Duration,
    index: usize,
}

/// A dependent task held back until every prerequisite has completed.
#[derive(Debug)]
struct DependencyEntry {
    task: SharedTask,
    prerequisites: HashMap<String, bool>,
}

impl DependencyEntry {
    fn satisfy(&mut self, task_id: &str) {
        if let Some(done) = self.prerequisites.get_mut(task_id) {
            *done = true;
        }
    }

    fn can_run(&self) -> bool {
        self.prerequisites.values().all(|done| *done)
    }
}

/// Results of one server batch
#[derive(Debug)]
struct BatchOutcome {
    index: usize,
    server: String,
    completed: Vec<SharedTask>,
    failed: Vec<SharedTask>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    servers: Vec<Arc<dyn Server>>,
    waits: HashMap<TaskPriority, BinaryHeap<Reverse<ServerWait>>>,
    pending: Vec<DependencyEntry>,
    retries: RetryQueue,
    completed_ids: HashSet<String>,
    // set by placement, cleared when a batch starts
    tasks_queued: bool,
}

impl SchedulerState {
    fn reset_waits(&mut self) {
        let count = self.servers.len();
        for priority in TaskPriority::ORDER {
            let heap = (0..count)
                .map(|index| {
                    Reverse(ServerWait {
                        expected_wait: Duration::ZERO,
                        index,
                    })
                })
                .collect();
            self.waits.insert(priority, heap);
        }
    }

    /// Mark `completed` prerequisites satisfied and pull out every entry
    /// that can now run, in submission order.
    fn release_dependencies(&mut self, completed: &[String]) -> Vec<SharedTask> {
        for entry in self.pending.iter_mut() {
            for id in completed {
                entry.satisfy(id);
            }
        }

        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(DependencyEntry::can_run);
        self.pending = waiting;
        ready.into_iter().map(|entry| entry.task).collect()
    }
}

/// Places tasks on registered servers and drives batches until all work
/// has completed or been abandoned.
///
/// Placement is greedy: each task goes to the server with the lowest
/// expected wait in the task's priority lane. Dependent tasks are held until
/// their prerequisites complete. Failed tasks are retried according to the
/// scheduler's `RetryPolicy`.
#[derive(Debug)]
pub struct TaskScheduler {
    state: Mutex<SchedulerState>,
    policy: RetryPolicy,
    run_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        counter!("taskgrid.scheduler.tasks_placed_total", 0);
        counter!("taskgrid.scheduler.tasks_retried_total", 0);
        counter!("taskgrid.scheduler.tasks_abandoned_total", 0);
        gauge!("taskgrid.scheduler.retry_queue_depth", 0.0);

        Self {
            state: Mutex::new(SchedulerState::default()),
            policy,
            run_lock: Mutex::new(()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Scheduler that never retries failed tasks
    pub fn with_default_policy() -> Self {
        Self::new(RetryPolicy::default())
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(RetryPolicy::from_config(&config.retry))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Register a private copy of `server`. The caller's instance is never
    /// touched by scheduling.
    pub async fn add_server(&self, server: &dyn Server) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if state.servers.iter().any(|s| s.name() == server.name()) {
            return Err(SchedulerError::DuplicateServer(server.name().to_string()));
        }

        let index = state.servers.len();
        state.servers.push(server.duplicate());
        for priority in TaskPriority::ORDER {
            state.waits.entry(priority).or_default().push(Reverse(ServerWait {
                expected_wait: Duration::ZERO,
                index,
            }));
        }

        info!(server = %server.name(), index, "server registered");
        Ok(())
    }

    /// Deregister a server. Its queued tasks are moved to the remaining
    /// servers; tasks nobody accepts are handed back to the caller.
    ///
    /// The server is drained before it is dropped. If the drain fails it
    /// stays registered and the error is returned, so its tasks are still
    /// reported by its next batch.
    pub async fn remove_server(&self, name: &str) -> SchedulerResult<Vec<SharedTask>> {
        let mut state = self.state.lock().await;
        let index = state
            .servers
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| SchedulerError::UnknownServer(name.to_string()))?;

        let drained = state.servers[index].remove_all_tasks().await.map_err(|e| {
            warn!(server = %name, error = %e, "could not drain server, keeping it registered");
            SchedulerError::Server(e)
        })?;

        state.servers.remove(index);
        for heap in state.waits.values_mut() {
            let kept: BinaryHeap<_> = heap
                .drain()
                .filter(|Reverse(w)| w.index != index)
                .map(|Reverse(mut w)| {
                    if w.index > index {
                        w.index -= 1;
                    }
                    Reverse(w)
                })
                .collect();
            *heap = kept;
        }
        info!(server = %name, drained = drained.len(), "server deregistered");

        let mut returned = Vec::new();
        for task in drained {
            if let Err(e) = Self::place(&mut state, task.clone()).await {
                warn!(task_id = %task.id(), error = %e, "task from deregistered server not re-placed");
                returned.push(task);
            }
        }
        Ok(returned)
    }

    pub async fn server_count(&self) -> usize {
        self.state.lock().await.servers.len()
    }

    /// Submit a task. Independent tasks (and tasks whose prerequisites have
    /// already completed) are placed immediately; others are held.
    pub async fn schedule_task(&self, task: SharedTask) -> SchedulerResult<()> {
        if task.id().trim().is_empty() {
            return Err(TaskError::Invalid("task id cannot be empty".into()).into());
        }

        let mut state = self.state.lock().await;
        if state.servers.is_empty() {
            return Err(SchedulerError::NoServers);
        }

        let prerequisites: HashMap<String, bool> = task
            .dependencies()
            .into_iter()
            .map(|id| {
                let done = state.completed_ids.contains(&id);
                (id, done)
            })
            .collect();

        let entry = DependencyEntry {
            task,
            prerequisites,
        };
        if entry.can_run() {
            Self::place(&mut state, entry.task).await?;
        } else {
            debug!(
                task_id = %entry.task.id(),
                prerequisites = entry.prerequisites.len(),
                "task held until dependencies complete"
            );
            state.pending.push(entry);
        }
        Ok(())
    }

    /// Put `task` on the server with the lowest expected wait for its
    /// priority, falling back to the next one when a server rejects it.
    async fn place(state: &mut SchedulerState, task: SharedTask) -> SchedulerResult<String> {
        if state.servers.is_empty() {
            return Err(SchedulerError::NoServers);
        }

        let priority = task.priority();
        let mut order: Vec<ServerWait> = std::mem::take(state.waits.entry(priority).or_default())
            .into_iter()
            .map(|Reverse(w)| w)
            .collect();
        order.sort();

        let mut accepted = None;
        for (pos, wait) in order.iter().enumerate() {
            let server = &state.servers[wait.index];
            match server.add_task(task.clone()).await {
                Ok(()) => {
                    accepted = Some(pos);
                    break;
                }
                Err(e) => {
                    warn!(
                        server = %server.name(),
                        task_id = %task.id(),
                        error = %e,
                        "server rejected task, trying next"
                    );
                }
            }
        }

        let result = match accepted {
            Some(pos) => {
                let wait = &mut order[pos];
                wait.expected_wait = wait.expected_wait.saturating_add(task.estimated_duration());
                state.tasks_queued = true;
                counter!("taskgrid.scheduler.tasks_placed_total", 1);

                let name = state.servers[wait.index].name().to_string();
                debug!(task_id = %task.id(), server = %name, %priority, "task placed");
                Ok(name)
            }
            None => Err(SchedulerError::NoServerAccepted {
                task_id: task.id().to_string(),
            }),
        };

        state
            .waits
            .insert(priority, order.into_iter().map(Reverse).collect());
        result
    }

    /// Place a task the scheduler already owns. A placement nobody accepts
    /// counts as a failed attempt.
    async fn place_or_fail(&self, state: &mut SchedulerState, task: SharedTask) {
        if let Err(e) = Self::place(state, task.clone()).await {
            warn!(task_id = %task.id(), error = %e, "placement failed");
            self.record_failure(state, task, Instant::now());
        }
    }

    fn record_failure(&self, state: &mut SchedulerState, task: SharedTask, now: Instant) {
        let task_id = task.id().to_string();
        match state.retries.record_failure(task, &self.policy, now) {
            RetryDecision::Queued { attempt, delay } => {
                counter!("taskgrid.scheduler.tasks_retried_total", 1);
                warn!(
                    task_id = %task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "task failed, retry scheduled"
                );
            }
            RetryDecision::Abandoned { attempts } => {
                counter!("taskgrid.scheduler.tasks_abandoned_total", 1);
                error!(task_id = %task_id, attempts, "task abandoned after exhausting retries");
            }
        }
    }

    /// Run one batch on every server in parallel.
    async fn run_batch(&self) -> Vec<BatchOutcome> {
        let servers = {
            let mut state = self.state.lock().await;
            state.reset_waits();
            state.tasks_queued = false;
            state.servers.clone()
        };

        let mut batches = JoinSet::new();
        for (index, server) in servers.into_iter().enumerate() {
            batches.spawn(async move {
                let completed = match server.execute_tasks().await {
                    Ok(completed) => completed,
                    Err(e) => {
                        warn!(server = %server.name(), error = %e, "batch failed");
                        Vec::new()
                    }
                };
                let failed = match server.failed_tasks().await {
                    Ok(failed) => failed,
                    Err(e) => {
                        error!(server = %server.name(), error = %e, "failed tasks unavailable");
                        Vec::new()
                    }
                };
                BatchOutcome {
                    index,
                    server: server.name().to_string(),
                    completed,
                    failed,
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = batches.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "server batch aborted"),
            }
        }
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }

    /// Fold batch results back into the scheduler: record completions,
    /// release dependents, queue retries, and place eligible retries.
    async fn absorb(
        &self,
        state: &mut SchedulerState,
        outcomes: Vec<BatchOutcome>,
        results: &mut HashMap<String, Vec<SharedTask>>,
    ) {
        let now = Instant::now();
        let mut newly_completed = Vec::new();
        let mut failed = Vec::new();

        for outcome in outcomes {
            newly_completed.extend(outcome.completed.iter().map(|t| t.id().to_string()));
            results
                .entry(outcome.server)
                .or_default()
                .extend(outcome.completed);
            failed.extend(outcome.failed);
        }

        for id in &newly_completed {
            state.retries.forget(id);
            state.completed_ids.insert(id.clone());
        }

        for task in state.release_dependencies(&newly_completed) {
            debug!(task_id = %task.id(), "dependencies satisfied");
            self.place_or_fail(state, task).await;
        }

        for task in failed {
            self.record_failure(state, task, now);
        }

        self.place_eligible_retries(state).await;
    }

    async fn place_eligible_retries(&self, state: &mut SchedulerState) {
        for task in state.retries.drain_eligible(Instant::now()) {
            debug!(task_id = %task.id(), attempts = state.retries.attempts(task.id()), "retrying task");
            self.place_or_fail(state, task).await;
        }
        gauge!("taskgrid.scheduler.retry_queue_depth", state.retries.len() as f64);
    }

    /// Sleep until `wake`. Returns false if shutdown was requested first.
    async fn wait_for_retry(wake: Instant, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }

    /// Run batches until nothing is queued, no retry is waiting and no held
    /// task can be released. Returns the tasks each server completed.
    ///
    /// Tasks that exhaust their retries, or whose prerequisites never
    /// complete (including dependency cycles), are abandoned and logged.
    pub async fn execute_all(&self) -> SchedulerResult<HashMap<String, Vec<SharedTask>>> {
        let _run = self.run_lock.lock().await;
        let mut shutdown = self.shutdown_rx.clone();

        let mut results: HashMap<String, Vec<SharedTask>> = {
            let state = self.state.lock().await;
            if state.servers.is_empty() {
                return Err(SchedulerError::NoServers);
            }
            state
                .servers
                .iter()
                .map(|s| (s.name().to_string(), Vec::new()))
                .collect()
        };

        let started = Instant::now();
        let mut batches = 0usize;
        info!("execution started");

        'run: loop {
            let outcomes = self.run_batch().await;
            batches += 1;

            let mut state = self.state.lock().await;
            self.absorb(&mut state, outcomes, &mut results).await;

            loop {
                if state.tasks_queued {
                    continue 'run;
                }
                let Some(wake) = state.retries.next_eligible_at() else {
                    break 'run;
                };
                drop(state);

                if !Self::wait_for_retry(wake, &mut shutdown).await {
                    warn!("shutdown requested, abandoning queued retries");
                    let mut state = self.state.lock().await;
                    for task in state.retries.take_all() {
                        counter!("taskgrid.scheduler.tasks_abandoned_total", 1);
                        error!(task_id = %task.id(), "retry abandoned by shutdown");
                    }
                    break 'run;
                }

                state = self.state.lock().await;
                self.place_eligible_retries(&mut state).await;
            }
        }

        let mut state = self.state.lock().await;
        for entry in state.pending.drain(..) {
            let unmet: Vec<&String> = entry
                .prerequisites
                .iter()
                .filter(|(_, done)| !**done)
                .map(|(id, _)| id)
                .collect();
            counter!("taskgrid.scheduler.tasks_abandoned_total", 1);
            error!(
                task_id = %entry.task.id(),
                unmet = ?unmet,
                "task abandoned with unmet dependencies"
            );
        }
        gauge!("taskgrid.scheduler.retry_queue_depth", state.retries.len() as f64);

        let completed: usize = results.values().map(Vec::len).sum();
        info!(
            batches,
            completed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        );
        Ok(results)
    }

    /// Per-server statistics snapshots, keyed by server name.
    pub async fn server_stats(&self) -> HashMap<String, ServerStats> {
        let servers = self.state.lock().await.servers.clone();
        let mut stats = HashMap::new();
        for server in servers {
            match server.stats().await {
                Ok(snapshot) => {
                    stats.insert(server.name().to_string(), snapshot);
                }
                Err(e) => warn!(server = %server.name(), error = %e, "stats unavailable"),
            }
        }
        stats
    }

    /// Interrupt any retry wait. Queued retries are abandoned and
    /// `execute_all` returns.
    pub fn shutdown(&self) {
        info!("scheduler shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::with_default_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::{Task, TaskBuilder};

    fn entry(deps: &[&str]) -> DependencyEntry {
        let task = TaskBuilder::new("t").depends_on(deps.iter().copied()).build().unwrap();
        DependencyEntry {
            prerequisites: task.dependencies().into_iter().map(|d| (d, false)).collect(),
            task: Arc::new(task),
        }
    }

    #[test]
    fn dependency_entry_runs_once_all_satisfied() {
        let mut e = entry(&["a", "b"]);
        assert!(!e.can_run());
        e.satisfy("a");
        e.satisfy("unrelated");
        assert!(!e.can_run());
        e.satisfy("b");
        assert!(e.can_run());
    }

    #[test]
    fn server_wait_orders_by_wait_then_index() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(ServerWait { expected_wait: Duration::from_millis(5), index: 0 }));
        heap.push(Reverse(ServerWait { expected_wait: Duration::from_millis(1), index: 2 }));
        heap.push(Reverse(ServerWait { expected_wait: Duration::from_millis(1), index: 1 }));

        let Reverse(first) = heap.pop().unwrap();
        assert_eq!(first.index, 1);
        let Reverse(second) = heap.pop().unwrap();
        assert_eq!(second.index, 2);
    }

    #[test]
    fn release_keeps_unready_entries() {
        let mut state = SchedulerState::default();
        state.pending.push(entry(&["a"]));
        state.pending.push(entry(&["a", "b"]));

        let released = state.release_dependencies(&["a".to_string()]);
        assert_eq!(released.len(), 1);
        assert_eq!(state.pending.len(), 1);
    }
}
