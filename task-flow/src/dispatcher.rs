use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TaskError},
    handler::{JobContext, JobHandler, JobOutcome},
    message::{TaskHandle, TaskMessage, TaskState},
    store::{InMemoryTaskStore, TaskRecord, TaskStore},
};

/// Retry behavior for failed attempts.
///
/// The redelivery delay grows linearly with the retry count:
/// `base_delay * (attempt + 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(attempt + 1);
        scaled.min(self.max_delay)
    }
}

/// Per-attempt execution budgets.
///
/// The hard budget is enforced by the executor (the attempt is aborted);
/// the soft budget is handed to the handler so it can wind down cleanly
/// before the hard cutoff.
#[derive(Debug, Clone)]
pub struct TimeBudget {
    pub hard: Duration,
    pub soft: Duration,
}

impl Default for TimeBudget {
    fn default() -> Self {
        Self {
            hard: Duration::from_secs(300),
            soft: Duration::from_secs(280),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub budget: TimeBudget,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            budget: TimeBudget::default(),
        }
    }
}

/// One delivery of a task to a worker. Redeliveries after a retry carry
/// an incremented attempt counter; redeliveries after a lost worker do not.
#[derive(Debug, Clone)]
struct Delivery {
    task_id: String,
    attempt: u32,
}

/// Snapshot of a task returned by `Dispatcher::poll`.
#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub task_id: String,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl From<TaskRecord> for PollResult {
    fn from(record: TaskRecord) -> Self {
        Self {
            task_id: record.id,
            state: record.state,
            result: record.result,
            error: record.error,
            attempts: record.attempts,
        }
    }
}

struct DispatcherInner {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    store: Arc<dyn TaskStore>,
    watchers: DashMap<String, watch::Sender<TaskState>>,
    config: DispatcherConfig,
}

impl DispatcherInner {
    fn notify(&self, task_id: &str, state: TaskState) {
        if let Some(sender) = self.watchers.get(task_id) {
            let _ = sender.send(state);
        }
    }

    async fn update_record<F>(&self, task_id: &str, apply: F)
    where
        F: FnOnce(&mut TaskRecord),
    {
        match self.store.get(task_id).await {
            Ok(Some(mut record)) => {
                apply(&mut record);
                let state = record.state;
                if let Err(e) = self.store.save(record).await {
                    error!(task_id = %task_id, error = %e, "Failed to persist task record");
                }
                self.notify(task_id, state);
            }
            Ok(None) => warn!(task_id = %task_id, "Task record vanished during update"),
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to load task record"),
        }
    }

    async fn finish_succeeded(&self, task_id: &str, result: Value) {
        self.update_record(task_id, |record| {
            record.state = TaskState::Succeeded;
            record.result = Some(result);
            record.finished_at = Some(chrono::Utc::now());
        })
        .await;
        self.drop_watcher(task_id);
        info!(task_id = %task_id, "Task succeeded");
    }

    async fn finish_failed(&self, task_id: &str, message: String) {
        self.update_record(task_id, |record| {
            record.state = TaskState::Failed;
            record.error = Some(message.clone());
            record.finished_at = Some(chrono::Utc::now());
        })
        .await;
        self.drop_watcher(task_id);
        warn!(task_id = %task_id, "Task failed terminally");
    }

    /// Terminal states are read from the store, so the watcher is no longer
    /// needed once the final notify went out. Pollers already subscribed see
    /// the closed channel and fall back to reading the store.
    fn drop_watcher(&self, task_id: &str) {
        self.watchers.remove(task_id);
    }
}

/// How one attempt ended, before retry accounting.
enum AttemptEnd {
    Done(Value),
    Retryable { error: String, delay: Option<Duration> },
    Unrecoverable(String),
    /// Worker lost mid-attempt (panic): redeliver without consuming a retry.
    Lost,
}

/// Background task dispatcher: a worker pool over an in-process queue with
/// at-least-once delivery. A delivery is acknowledged only by reaching a
/// terminal state, so a lost worker redelivers rather than dropping work.
///
/// The dispatcher is expected to live for the whole process; there is no
/// graceful shutdown beyond dropping it and letting the runtime wind down.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Enqueue a task. Fails fast if no handler is registered for the
    /// message's task name.
    pub async fn submit(&self, message: TaskMessage) -> Result<TaskHandle> {
        if !self.inner.handlers.contains_key(&message.task_name) {
            return Err(TaskError::HandlerNotFound(message.task_name));
        }

        let id = Uuid::new_v4().to_string();
        let record = TaskRecord::new(id.clone(), message);
        self.inner.store.save(record).await?;

        let (sender, _) = watch::channel(TaskState::Queued);
        self.inner.watchers.insert(id.clone(), sender);

        self.tx
            .send(Delivery {
                task_id: id.clone(),
                attempt: 0,
            })
            .map_err(|_| TaskError::ExecutionFailed("task queue is closed".to_string()))?;

        info!(task_id = %id, "Task submitted");
        Ok(TaskHandle { id })
    }

    /// Wait up to `max_wait` for the task to reach a terminal state, then
    /// return the last-known snapshot. An expired or unknown task id yields
    /// `TaskError::TaskNotFound`.
    pub async fn poll(&self, task_id: &str, max_wait: Duration) -> Result<PollResult> {
        let deadline = Instant::now() + max_wait;
        let mut watch_rx = self
            .inner
            .watchers
            .get(task_id)
            .map(|sender| sender.subscribe());

        loop {
            let record = match self.inner.store.get(task_id).await? {
                Some(record) => record,
                None => {
                    // Expired or never existed; the watcher is stale either way.
                    self.inner.watchers.remove(task_id);
                    return Err(TaskError::TaskNotFound(task_id.to_string()));
                }
            };

            if record.state.is_terminal() {
                return Ok(PollResult::from(record));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(PollResult::from(record));
            }
            let remaining = deadline - now;

            match &mut watch_rx {
                Some(rx) => match timeout(remaining, rx.changed()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => {
                        watch_rx = None;
                        continue;
                    }
                    Err(_) => {
                        let record = self
                            .inner
                            .store
                            .get(task_id)
                            .await?
                            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?;
                        return Ok(PollResult::from(record));
                    }
                },
                None => {
                    // No watcher available: coarse-grained polling.
                    sleep(remaining.min(Duration::from_millis(250))).await;
                }
            }
        }
    }
}

pub struct DispatcherBuilder {
    handlers: Vec<Arc<dyn JobHandler>>,
    store: Option<Arc<dyn TaskStore>>,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            store: None,
            config: DispatcherConfig::default(),
        }
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the dispatcher and spawn its worker pool. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Dispatcher {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));

        let handlers = DashMap::new();
        for handler in self.handlers {
            handlers.insert(handler.name().to_string(), handler);
        }

        let inner = Arc::new(DispatcherInner {
            handlers,
            store,
            watchers: DashMap::new(),
            config: self.config,
        });

        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..inner.config.workers.max(1) {
            tokio::spawn(worker_loop(inner.clone(), rx.clone(), tx.clone()));
        }

        Dispatcher { inner, tx }
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(
    inner: Arc<DispatcherInner>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    tx: mpsc::UnboundedSender<Delivery>,
) {
    loop {
        let delivery = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        match delivery {
            Some(delivery) => process_delivery(&inner, &tx, delivery).await,
            None => break,
        }
    }
}

async fn process_delivery(
    inner: &Arc<DispatcherInner>,
    tx: &mpsc::UnboundedSender<Delivery>,
    delivery: Delivery,
) {
    let Delivery { task_id, attempt } = delivery;

    let record = match inner.store.get(&task_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(task_id = %task_id, "Dropping delivery for unknown task");
            return;
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to load task for delivery");
            return;
        }
    };

    inner
        .update_record(&task_id, |r| {
            r.state = TaskState::Running;
            r.attempts = attempt + 1;
        })
        .await;

    let Some(handler) = inner
        .handlers
        .get(&record.message.task_name)
        .map(|h| h.clone())
    else {
        inner
            .finish_failed(
                &task_id,
                format!("no handler registered for task: {}", record.message.task_name),
            )
            .await;
        return;
    };

    let ctx = JobContext {
        task_id: task_id.clone(),
        attempt,
        max_retries: inner.config.retry.max_retries,
        soft_time_limit: inner.config.budget.soft,
    };
    let message = record.message.clone();

    let mut attempt_handle = tokio::spawn(async move { handler.execute(message, ctx).await });

    let end = match timeout(inner.config.budget.hard, &mut attempt_handle).await {
        Err(_) => {
            attempt_handle.abort();
            AttemptEnd::Retryable {
                error: format!(
                    "hard time limit of {}s exceeded",
                    inner.config.budget.hard.as_secs()
                ),
                delay: None,
            }
        }
        Ok(Err(join_err)) if join_err.is_panic() => AttemptEnd::Lost,
        Ok(Err(join_err)) => AttemptEnd::Unrecoverable(format!("attempt aborted: {}", join_err)),
        Ok(Ok(Err(task_err))) => AttemptEnd::Unrecoverable(task_err.to_string()),
        Ok(Ok(Ok(JobOutcome::Done(value)))) => AttemptEnd::Done(value),
        Ok(Ok(Ok(JobOutcome::Retry { error, delay }))) => AttemptEnd::Retryable { error, delay },
    };

    match end {
        AttemptEnd::Done(value) => inner.finish_succeeded(&task_id, value).await,
        AttemptEnd::Unrecoverable(message) => inner.finish_failed(&task_id, message).await,
        AttemptEnd::Lost => {
            // The attempt was never acknowledged, so the message goes back on
            // the queue with the same attempt counter.
            warn!(task_id = %task_id, attempt, "Worker lost mid-attempt, redelivering");
            inner
                .update_record(&task_id, |r| r.state = TaskState::Queued)
                .await;
            if tx.send(Delivery { task_id: task_id.clone(), attempt }).is_err() {
                inner
                    .finish_failed(&task_id, "task queue closed during redelivery".to_string())
                    .await;
            }
        }
        AttemptEnd::Retryable { error, delay } => {
            if attempt < inner.config.retry.max_retries {
                let delay = delay.unwrap_or_else(|| inner.config.retry.delay_for(attempt));
                warn!(
                    task_id = %task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, scheduling retry"
                );
                inner
                    .update_record(&task_id, |r| {
                        r.state = TaskState::Retrying;
                        r.error = Some(error.clone());
                    })
                    .await;

                let tx = tx.clone();
                let retry_task_id = task_id.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    if tx
                        .send(Delivery {
                            task_id: retry_task_id.clone(),
                            attempt: attempt + 1,
                        })
                        .is_err()
                    {
                        warn!(task_id = %retry_task_id, "Queue closed before retry redelivery");
                    }
                });
            } else {
                inner.finish_failed(&task_id, error).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> DispatcherConfig {
        DispatcherConfig {
            workers: 2,
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
            },
            budget: TimeBudget {
                hard: Duration::from_secs(5),
                soft: Duration::from_secs(4),
            },
        }
    }

    struct FlakyHandler {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _message: TaskMessage, _ctx: JobContext) -> Result<JobOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Ok(JobOutcome::Retry {
                    error: format!("transient failure on call {}", call),
                    delay: None,
                })
            } else {
                Ok(JobOutcome::Done(serde_json::json!({ "call": call })))
            }
        }
    }

    struct PanicOnceHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for PanicOnceHandler {
        fn name(&self) -> &str {
            "panic_once"
        }

        async fn execute(&self, _message: TaskMessage, _ctx: JobContext) -> Result<JobOutcome> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("simulated worker loss");
            }
            Ok(JobOutcome::Done(serde_json::json!("recovered")))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _message: TaskMessage, _ctx: JobContext) -> Result<JobOutcome> {
            sleep(Duration::from_millis(300)).await;
            Ok(JobOutcome::Done(serde_json::json!("done")))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(&self, _message: TaskMessage, _ctx: JobContext) -> Result<JobOutcome> {
            Err(TaskError::ExecutionFailed("boom".to_string()))
        }
    }

    #[test]
    fn retry_delay_grows_linearly_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        };
        let delays: Vec<_> = (0..5).map(|a| policy.delay_for(a)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must be non-decreasing");
        }
        assert_eq!(delays[0], Duration::from_secs(10));
        assert_eq!(delays[4], Duration::from_secs(50));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn task_retried_twice_then_succeeds() {
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(FlakyHandler {
                failures_before_success: 2,
                calls: AtomicU32::new(0),
            }))
            .with_config(fast_config(3))
            .build();

        let handle = dispatcher
            .submit(TaskMessage::new("flaky"))
            .await
            .unwrap();
        let result = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.state, TaskState::Succeeded);
        // First delivery plus exactly two retries.
        assert_eq!(result.attempts, 3);
        assert_eq!(result.result.unwrap()["call"], 2);
    }

    #[tokio::test]
    async fn task_exceeding_retry_cap_fails_with_last_error() {
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(FlakyHandler {
                failures_before_success: u32::MAX,
                calls: AtomicU32::new(0),
            }))
            .with_config(fast_config(2))
            .build();

        let handle = dispatcher
            .submit(TaskMessage::new("flaky"))
            .await
            .unwrap();
        let result = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.attempts, 3);
        // Terminal error is the last attempt's error.
        assert!(result.error.unwrap().contains("transient failure on call 2"));
    }

    #[tokio::test]
    async fn unrecoverable_error_fails_without_retry() {
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(FailingHandler))
            .with_config(fast_config(3))
            .build();

        let handle = dispatcher
            .submit(TaskMessage::new("failing"))
            .await
            .unwrap();
        let result = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.attempts, 1);
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn lost_worker_redelivers_without_consuming_retries() {
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(PanicOnceHandler {
                calls: AtomicU32::new(0),
            }))
            .with_config(fast_config(0))
            .build();

        let handle = dispatcher
            .submit(TaskMessage::new("panic_once"))
            .await
            .unwrap();
        let result = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();

        // Zero retries allowed, yet the redelivery after the panic still ran.
        assert_eq!(result.state, TaskState::Succeeded);
        assert_eq!(result.result.unwrap(), serde_json::json!("recovered"));
    }

    #[tokio::test]
    async fn poll_timeout_returns_last_known_state() {
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(SlowHandler))
            .with_config(fast_config(0))
            .build();

        let handle = dispatcher.submit(TaskMessage::new("slow")).await.unwrap();

        let early = dispatcher
            .poll(&handle.id, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!early.state.is_terminal());
        assert!(early.result.is_none());

        let done = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn hard_time_limit_aborts_the_attempt() {
        let mut config = fast_config(0);
        config.budget = TimeBudget {
            hard: Duration::from_millis(50),
            soft: Duration::from_millis(40),
        };
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(SlowHandler))
            .with_config(config)
            .build();

        let handle = dispatcher.submit(TaskMessage::new("slow")).await.unwrap();
        let result = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.state, TaskState::Failed);
        assert!(result.error.unwrap().contains("hard time limit"));
    }

    #[tokio::test]
    async fn submit_without_handler_is_rejected() {
        let dispatcher = Dispatcher::builder().with_config(fast_config(0)).build();

        let err = dispatcher
            .submit(TaskMessage::new("nobody_home"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::HandlerNotFound(_)));
    }

    #[tokio::test]
    async fn expired_result_reads_back_as_unknown() {
        let store = Arc::new(InMemoryTaskStore::with_result_ttl(Duration::from_millis(
            50,
        )));
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(FlakyHandler {
                failures_before_success: 0,
                calls: AtomicU32::new(0),
            }))
            .with_store(store)
            .with_config(fast_config(0))
            .build();

        let handle = dispatcher
            .submit(TaskMessage::new("flaky"))
            .await
            .unwrap();
        let done = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Succeeded);

        sleep(Duration::from_millis(120)).await;
        let err = dispatcher
            .poll(&handle.id, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn watcher_is_dropped_once_the_task_is_terminal() {
        let dispatcher = Dispatcher::builder()
            .register(Arc::new(FlakyHandler {
                failures_before_success: 0,
                calls: AtomicU32::new(0),
            }))
            .with_config(fast_config(0))
            .build();

        let handle = dispatcher
            .submit(TaskMessage::new("flaky"))
            .await
            .unwrap();
        assert!(dispatcher.inner.watchers.contains_key(&handle.id));

        let done = dispatcher
            .poll(&handle.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Succeeded);

        // Watcher removal races the final notify by a hair.
        sleep(Duration::from_millis(100)).await;
        assert!(!dispatcher.inner.watchers.contains_key(&handle.id));

        // The record itself is still readable until its TTL lapses.
        let again = dispatcher
            .poll(&handle.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(again.state, TaskState::Succeeded);
    }
}
