use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::Result,
    message::{TaskMessage, TaskState},
};

/// Everything the dispatcher persists about one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub message: TaskMessage,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Number of deliveries so far (first delivery counts as 1).
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: String, message: TaskMessage) -> Self {
        Self {
            id,
            message,
            state: TaskState::Queued,
            result: None,
            error: None,
            attempts: 0,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Trait for storing and retrieving task records (the result backend).
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, record: TaskRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<TaskRecord>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Every this many saves the store sweeps out expired terminal records,
/// so results from tasks that are never polled again do not accumulate.
const SWEEP_EVERY_SAVES: u64 = 64;

/// In-memory implementation of `TaskStore`.
///
/// Terminal results expire once `result_ttl` has elapsed after completion
/// and read back as absent. Eviction happens on read for the record being
/// read, plus an amortized sweep of the whole map on write.
pub struct InMemoryTaskStore {
    records: DashMap<String, TaskRecord>,
    result_ttl: Duration,
    saves_since_sweep: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_result_ttl(Duration::from_secs(3600))
    }

    pub fn with_result_ttl(result_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            result_ttl,
            saves_since_sweep: AtomicU64::new(0),
        }
    }

    /// Evict every expired terminal record, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !self.is_expired(record));
        before.saturating_sub(self.records.len())
    }

    fn is_expired(&self, record: &TaskRecord) -> bool {
        if !record.state.is_terminal() {
            return false;
        }
        match record.finished_at {
            Some(finished_at) => {
                let age = Utc::now().signed_duration_since(finished_at);
                age.to_std().map(|d| d > self.result_ttl).unwrap_or(false)
            }
            None => false,
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, record: TaskRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        let saves = self.saves_since_sweep.fetch_add(1, Ordering::Relaxed) + 1;
        if saves % SWEEP_EVERY_SAVES == 0 {
            self.sweep_expired();
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let expired = match self.records.get(id) {
            Some(entry) => {
                if self.is_expired(&entry) {
                    true
                } else {
                    return Ok(Some(entry.clone()));
                }
            }
            None => return Ok(None),
        };
        if expired {
            self.records.remove(id);
        }
        Ok(None)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_evicts_only_expired_terminal_records() {
        let store = InMemoryTaskStore::with_result_ttl(Duration::from_secs(3600));

        let mut done = TaskRecord::new("done".to_string(), TaskMessage::new("noop"));
        done.state = TaskState::Succeeded;
        done.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.save(done).await.unwrap();

        let mut running = TaskRecord::new("running".to_string(), TaskMessage::new("noop"));
        running.state = TaskState::Running;
        store.save(running).await.unwrap();

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.sweep_expired(), 0);
        assert!(store.get("done").await.unwrap().is_none());
        assert!(store.get("running").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fresh_terminal_records_survive_the_sweep() {
        let store = InMemoryTaskStore::new();

        let mut done = TaskRecord::new("done".to_string(), TaskMessage::new("noop"));
        done.state = TaskState::Succeeded;
        done.finished_at = Some(Utc::now());
        store.save(done).await.unwrap();

        assert_eq!(store.sweep_expired(), 0);
        assert!(store.get("done").await.unwrap().is_some());
    }
}
