// src/engine/task.rs
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::queue::TaskPriority;
use crate::utils::error::TaskError;

/// --------------------------------
/// Task capability
/// --------------------------------
///
/// The unit of work handed to servers. The scheduler only ever reads
/// `id`, `priority`, `estimated_duration`, `dependencies` and
/// `is_completed`; servers additionally drive `execute` and `cleanup`.
///
/// `is_completed` reflects the most recent attempt only. Implementations
/// must clear it when a new attempt starts.
#[async_trait]
pub trait Task: Send + Sync + fmt::Debug {
    /// Caller-supplied identifier. Uniqueness is not checked.
    fn id(&self) -> &str;

    fn priority(&self) -> TaskPriority {
        TaskPriority::None
    }

    /// Used for load balancing only, never enforced.
    fn estimated_duration(&self) -> Duration;

    /// Ids of tasks that must complete before this one may be placed.
    fn dependencies(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Attempt the work.
    async fn execute(&self) -> Result<(), TaskError>;

    /// Release partial side effects after an abandoned attempt.
    async fn cleanup(&self) -> Result<(), TaskError> {
        Ok(())
    }

    fn is_completed(&self) -> bool;
}

pub type SharedTask = Arc<dyn Task>;

/// --------------------------------
/// Simple Task
/// --------------------------------
///
/// A task whose work is simulated by sleeping for `work`. Completes on
/// every attempt that is allowed to finish.
#[derive(Debug)]
pub struct SimpleTask {
    id: String,
    priority: TaskPriority,
    estimated: Duration,
    work: Duration,
    dependencies: HashSet<String>,
    completed: AtomicBool,
    attempts: AtomicU32,
    cleanups: AtomicU32,
}

impl SimpleTask {
    pub fn new(id: impl Into<String>, estimated: Duration) -> Result<Self, TaskError> {
        TaskBuilder::new(id).estimated(estimated).build()
    }

    /// Number of times `execute` has been called
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of times `cleanup` has been called
    pub fn cleanups(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn work(&self) -> Duration {
        self.work
    }

    pub fn into_shared(self) -> SharedTask {
        Arc::new(self)
    }
}

#[async_trait]
impl Task for SimpleTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn estimated_duration(&self) -> Duration {
        self.estimated
    }

    fn dependencies(&self) -> HashSet<String> {
        self.dependencies.clone()
    }

    async fn execute(&self) -> Result<(), TaskError> {
        self.completed.store(false, Ordering::SeqCst);
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(task_id = %self.id, attempt, "executing task");

        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }

        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), TaskError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        debug!(task_id = %self.id, "cleaning up task");
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

/// --------------------------------
/// Task Builder
/// --------------------------------
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    id: String,
    priority: TaskPriority,
    estimated: Duration,
    work: Duration,
    dependencies: HashSet<String>,
}

impl TaskBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: TaskPriority::None,
            estimated: Duration::ZERO,
            work: Duration::ZERO,
            dependencies: HashSet::new(),
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Estimated duration used for placement.
    pub fn estimated(mut self, estimated: Duration) -> Self {
        self.estimated = estimated;
        self
    }

    /// Real time spent by each attempt.
    pub fn work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<SimpleTask, TaskError> {
        if self.id.trim().is_empty() {
            return Err(TaskError::Invalid("task id cannot be empty".into()));
        }
        if self.dependencies.iter().any(|d| d.trim().is_empty()) {
            return Err(TaskError::Invalid(format!(
                "task {} declares an empty dependency id",
                self.id
            )));
        }

        Ok(SimpleTask {
            id: self.id,
            priority: self.priority,
            estimated: self.estimated,
            work: self.work,
            dependencies: self.dependencies,
            completed: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let task = TaskBuilder::new("a").build().unwrap();
        assert_eq!(task.id(), "a");
        assert_eq!(task.priority(), TaskPriority::None);
        assert!(task.dependencies().is_empty());
        assert_eq!(task.estimated_duration(), Duration::ZERO);
        assert!(!task.is_completed());
    }

    #[test]
    fn builder_rejects_empty_ids() {
        assert!(matches!(TaskBuilder::new("  ").build(), Err(TaskError::Invalid(_))));
        assert!(matches!(
            TaskBuilder::new("b").depends_on([""]).build(),
            Err(TaskError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn execute_sets_completion_and_counts_attempts() {
        let task = TaskBuilder::new("c")
            .priority(TaskPriority::High)
            .depends_on(["a", "b"])
            .build()
            .unwrap();

        task.execute().await.unwrap();
        task.execute().await.unwrap();

        assert!(task.is_completed());
        assert_eq!(task.attempts(), 2);
        assert_eq!(task.dependencies().len(), 2);
    }
}
