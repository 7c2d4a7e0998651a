pub mod error;

pub use error::{ChannelFault, SchedulerError, SchedulerResult, ServerError, TaskError};
