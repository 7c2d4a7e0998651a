// Shared test doubles for the integration tests
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use taskgrid::{SharedTask, Task, TaskError, TaskPriority};

pub type ExecutionLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> ExecutionLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn logged(log: &ExecutionLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Task that fails its first `fail_first` attempts and records when each
/// attempt started.
#[derive(Debug)]
pub struct ScriptedTask {
    id: String,
    priority: TaskPriority,
    estimated: Duration,
    dependencies: HashSet<String>,
    fail_first: u32,
    panics: bool,
    starts: Mutex<Vec<Instant>>,
    cleanups: AtomicU32,
    completed: AtomicBool,
    log: Option<ExecutionLog>,
}

impl ScriptedTask {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            priority: TaskPriority::None,
            estimated: Duration::ZERO,
            dependencies: HashSet::new(),
            fail_first: 0,
            panics: false,
            starts: Mutex::new(Vec::new()),
            cleanups: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            log: None,
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn estimated_ms(mut self, ms: u64) -> Self {
        self.estimated = Duration::from_millis(ms);
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn failing(mut self, attempts: u32) -> Self {
        self.fail_first = attempts;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing(u32::MAX)
    }

    /// Panic inside `execute` on every attempt
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn logging_to(mut self, log: &ExecutionLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn shared(self) -> Arc<ScriptedTask> {
        Arc::new(self)
    }

    pub fn attempts(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn starts(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }

    /// Gaps between consecutive attempt starts
    pub fn gaps(&self) -> Vec<Duration> {
        self.starts()
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect()
    }

    pub fn cleanups(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for ScriptedTask {
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
        let attempt = {
            let mut starts = self.starts.lock().unwrap();
            starts.push(Instant::now());
            starts.len() as u32
        };
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.id.clone());
        }

        if self.panics {
            panic!("{} blew up on attempt {}", self.id, attempt);
        }
        if attempt <= self.fail_first {
            return Err(TaskError::Failed(format!("{} attempt {}", self.id, attempt)));
        }
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), TaskError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

pub fn ids(tasks: &[SharedTask]) -> Vec<String> {
    tasks.iter().map(|t| t.id().to_string()).collect()
}
