use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A unit of deferred work as it travels through the queue.
///
/// The shape mirrors the classic broker message: a task name used to look
/// up the registered handler, positional arguments and keyword arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskMessage {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.kwargs.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }
}

/// Lifecycle state of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Accepted and waiting for a worker
    Queued,
    /// Currently executing on a worker
    Running,
    /// A failed attempt is waiting for its redelivery delay
    Retrying,
    /// Terminal: the handler produced a result
    Succeeded,
    /// Terminal: attempts exhausted or the handler failed unrecoverably
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// Opaque reference to a submitted task, returned by `Dispatcher::submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: String,
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}
