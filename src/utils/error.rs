use std::time::Duration;

use thiserror::Error;

/// Failure of a single task attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Invalid task: {0}")]
    Invalid(String),
}

/// Transport-level failure reported by a remote channel.
///
/// The resilience wrapper treats every variant the same way; the detail is
/// only carried through for logging.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelFault {
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed node address: {0}")]
    MalformedAddress(String),

    #[error("no node bound under name {0}")]
    NotBound(String),
}

/// Errors surfaced by a server (local or remote).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    #[error("Server {server}: new task attempt started before the previous one was recorded")]
    OverlappingAttempt { server: String },

    #[error("Server {server} unreachable: {reason}")]
    Unreachable { server: String, reason: String },

    #[error("Server {server}: circuit open, request rejected")]
    CircuitOpen { server: String },

    #[error("Remote server {0} could not be resolved")]
    NameNotResolved(String),

    #[error("Remote server name is invalid: {0}")]
    InvalidName(String),
}

impl ServerError {
    pub fn unreachable<S: Into<String>, R: ToString>(server: S, reason: R) -> Self {
        ServerError::Unreachable {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures caused by the node being out of reach, as opposed
    /// to misuse of the server.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ServerError::Unreachable { .. } | ServerError::CircuitOpen { .. }
        )
    }
}

/// Errors returned to callers of the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No servers are registered")]
    NoServers,

    #[error("A server named {0} is already registered")]
    DuplicateServer(String),

    #[error("No server named {0} is registered")]
    UnknownServer(String),

    #[error("No server accepted task {task_id}")]
    NoServerAccepted { task_id: String },

    #[error("Retry attempt numbers start at 1, got {0}")]
    InvalidRetryAttempt(u32),

    #[error("Invalid task: {0}")]
    InvalidTask(#[from] TaskError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
