pub mod config;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod task;

pub use config::{BackoffKind, ConfigError, RemoteConfig, RetryConfig, SchedulerConfig};
pub use queue::{TaskPriority, TaskQueues};
pub use remote::{
    ChannelResolver, CircuitBreaker, LoopbackChannel, NodeRegistry, RemoteChannel, RemoteServer,
};
pub use retry::{
    BackoffFn, BackoffStrategy, RetryDecision, RetryPolicy, RetryQueue, MAX_RETRY_WAIT,
};
pub use scheduler::TaskScheduler;
pub use server::{LocalServer, Server, ServerMonitor, ServerStats, DEFAULT_TASK_TIMEOUT};
pub use task::{SharedTask, SimpleTask, Task, TaskBuilder};
