pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod store;

// Re-export commonly used types
pub use dispatcher::{
    Dispatcher, DispatcherBuilder, DispatcherConfig, PollResult, RetryPolicy, TimeBudget,
};
pub use error::{Result, TaskError};
pub use handler::{JobContext, JobHandler, JobOutcome};
pub use message::{TaskHandle, TaskMessage, TaskState};
pub use store::{InMemoryTaskStore, TaskRecord, TaskStore};
