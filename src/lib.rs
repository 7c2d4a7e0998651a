pub mod engine;
pub mod metrics;
pub mod utils;

// Re-export engine module
pub use engine::*;
pub use utils::error::{ChannelFault, SchedulerError, SchedulerResult, ServerError, TaskError};
