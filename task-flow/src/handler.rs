use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{error::Result, message::TaskMessage};

/// What a handler wants the dispatcher to do after one attempt.
///
/// Retry is an explicit transition rather than an exception: the handler
/// states that the attempt failed recoverably and the dispatcher decides
/// whether attempts remain. `Err(_)` from a handler is unrecoverable and
/// terminates the task without further attempts.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Terminal result, handed to pollers as-is.
    Done(Value),
    /// Re-enqueue for another attempt, subject to the retry cap.
    /// `delay` overrides the dispatcher's backoff when set.
    Retry {
        error: String,
        delay: Option<Duration>,
    },
}

/// Per-attempt execution context passed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub task_id: String,
    /// Zero-based attempt counter; 0 is the first delivery.
    pub attempt: u32,
    pub max_retries: u32,
    /// Soft budget: handlers should wind down their work within this
    /// duration. The dispatcher enforces a larger hard budget regardless.
    pub soft_time_limit: Duration,
}

impl JobContext {
    pub fn retries_remaining(&self) -> bool {
        self.attempt < self.max_retries
    }
}

/// Core trait implemented by every background job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Task name this handler answers to, matched against
    /// `TaskMessage::task_name`.
    fn name(&self) -> &str;

    /// Execute one attempt.
    async fn execute(&self, message: TaskMessage, ctx: JobContext) -> Result<JobOutcome>;
}
