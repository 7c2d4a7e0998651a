use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::task::SharedTask;

/// Task priority levels
///
/// Variants are declared in execution order, so the derived `Ord` puts
/// `High` first and `None` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
    None,
}

impl TaskPriority {
    /// Every priority, highest first.
    pub const ORDER: [TaskPriority; 4] = [
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
        TaskPriority::None,
    ];

    fn slot(self) -> usize {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Medium => 1,
            TaskPriority::Low => 2,
            TaskPriority::None => 3,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::None
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::None => write!(f, "none"),
        }
    }
}

/// One FIFO lane per priority level.
#[derive(Debug, Clone, Default)]
pub struct TaskQueues {
    lanes: [VecDeque<SharedTask>; 4],
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the lane matching its priority
    pub fn push(&mut self, task: SharedTask) {
        let slot = task.priority().slot();
        self.lanes[slot].push_back(task);
    }

    /// Number of tasks waiting in one lane
    pub fn lane_len(&self, priority: TaskPriority) -> usize {
        self.lanes[priority.slot()].len()
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    /// Take every queued task in execution order (priority first, then
    /// submission order), leaving all lanes empty.
    pub fn take_all(&mut self) -> Vec<SharedTask> {
        let mut ordered = Vec::with_capacity(self.len());
        for priority in TaskPriority::ORDER {
            ordered.extend(self.lanes[priority.slot()].drain(..));
        }
        ordered
    }

    /// Iterate queued tasks in execution order without consuming them.
    pub fn iter_in_order(&self) -> impl Iterator<Item = &SharedTask> {
        TaskPriority::ORDER
            .into_iter()
            .flat_map(move |p| self.lanes[p.slot()].iter())
    }
}
