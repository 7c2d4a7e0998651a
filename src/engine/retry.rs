//! Retry policies and the time-ordered retry queue

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::config::{BackoffKind, RetryConfig};
use super::task::SharedTask;
use crate::utils::error::SchedulerError;

/// Longest wait the retry queue schedules. Longer backoffs are clamped to it.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(u32::MAX as u64);

/// Delay function signature for custom backoff: attempt number (>= 1) → delay.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How the delay before a retry grows with the attempt number
#[derive(Clone)]
pub enum BackoffStrategy {
    /// Same delay for every attempt.
    Uniform(Duration),
    /// `initial * 2^(n-1)`
    Exponential { initial: Duration },
    /// `base + increment * (n-1)`
    Linear { base: Duration, increment: Duration },
    Custom(BackoffFn),
}

impl fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Uniform(d) => f.debug_tuple("Uniform").field(d).finish(),
            BackoffStrategy::Exponential { initial } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .finish(),
            BackoffStrategy::Linear { base, increment } => f
                .debug_struct("Linear")
                .field("base", base)
                .field("increment", increment)
                .finish(),
            BackoffStrategy::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl BackoffStrategy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self {
            BackoffStrategy::Uniform(d) => *d,
            BackoffStrategy::Exponential { initial } => 2u32
                .checked_pow(step)
                .and_then(|factor| initial.checked_mul(factor))
                .unwrap_or(Duration::MAX),
            BackoffStrategy::Linear { base, increment } => increment
                .checked_mul(step)
                .and_then(|extra| base.checked_add(extra))
                .unwrap_or(Duration::MAX),
            BackoffStrategy::Custom(f) => f(attempt),
        }
    }
}

/// Pure description of how often and how patiently a task is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// `max_attempts` counts every execution, the first one included.
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Run each task once; failures are abandoned immediately.
    pub fn no_retry() -> Self {
        Self::new(1, BackoffStrategy::Uniform(Duration::ZERO))
    }

    pub fn uniform(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, BackoffStrategy::Uniform(delay))
    }

    pub fn exponential(max_attempts: u32, initial: Duration) -> Self {
        Self::new(max_attempts, BackoffStrategy::Exponential { initial })
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let delay = Duration::from_millis(config.delay_ms);
        let backoff = match config.backoff {
            BackoffKind::Uniform => BackoffStrategy::Uniform(delay),
            BackoffKind::Exponential => BackoffStrategy::Exponential { initial: delay },
            BackoffKind::Linear => BackoffStrategy::Linear {
                base: delay,
                increment: Duration::from_millis(config.increment_ms),
            },
        };
        Self::new(config.max_attempts, backoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Delay to wait after the `attempt`-th failed execution.
    pub fn timeout_for_attempt(&self, attempt: u32) -> Result<Duration, SchedulerError> {
        if attempt < 1 {
            return Err(SchedulerError::InvalidRetryAttempt(attempt));
        }
        Ok(self.backoff.delay_for(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

/// Outcome of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryDecision {
    Queued { attempt: u32, delay: Duration },
    Abandoned { attempts: u32 },
}

/// Wrapper for BinaryHeap ordering (earliest eligible first)
#[derive(Debug)]
struct RetryEntry {
    task: SharedTask,
    eligible_at: Instant,
    seq: u64,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at == other.eligible_at && self.seq == other.seq
    }
}
impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // earliest first; ties keep insertion order
        other
            .eligible_at
            .cmp(&self.eligible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Failed tasks waiting out their backoff, plus per-task attempt counts.
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: BinaryHeap<RetryEntry>,
    attempts: HashMap<String, u32>,
    seq: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failed attempt and either queue the task for its next attempt
    /// or give up on it.
    pub fn record_failure(
        &mut self,
        task: SharedTask,
        policy: &RetryPolicy,
        now: Instant,
    ) -> RetryDecision {
        let attempts = self.attempts.entry(task.id().to_string()).or_insert(0);
        *attempts += 1;
        let attempt = *attempts;

        if attempt >= policy.max_attempts() {
            self.attempts.remove(task.id());
            return RetryDecision::Abandoned { attempts: attempt };
        }

        let delay = policy.backoff().delay_for(attempt);
        let eligible_at = eligible_after(now, delay);
        self.seq += 1;
        self.heap.push(RetryEntry {
            task,
            eligible_at,
            seq: self.seq,
        });

        RetryDecision::Queued { attempt, delay }
    }

    /// Pop every entry whose eligible time is at or before `now`.
    pub fn drain_eligible(&mut self, now: Instant) -> Vec<SharedTask> {
        let mut ready = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.eligible_at > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                ready.push(entry.task);
            }
        }
        ready
    }

    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.eligible_at)
    }

    /// Failures recorded so far for a task id
    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts.get(task_id).copied().unwrap_or(0)
    }

    /// Drop the attempt count of a task that has completed.
    pub fn forget(&mut self, task_id: &str) {
        self.attempts.remove(task_id);
    }

    /// Remove every waiting entry, earliest first. Their attempt counts
    /// are dropped with them.
    pub fn take_all(&mut self) -> Vec<SharedTask> {
        let mut all = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            self.attempts.remove(entry.task.id());
            all.push(entry.task);
        }
        all
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// `now + delay`, clamped to `MAX_RETRY_WAIT` and to what `Instant` can hold.
fn eligible_after(now: Instant, delay: Duration) -> Instant {
    let mut wait = delay.min(MAX_RETRY_WAIT);
    loop {
        if let Some(at) = now.checked_add(wait) {
            return at;
        }
        wait /= 2;
    }
}
