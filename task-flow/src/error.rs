use thiserror::Error;

/// Errors surfaced by the task dispatch layer
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("No handler registered for task: {0}")]
    HandlerNotFound(String),

    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
