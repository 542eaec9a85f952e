//! Bounded dead-letter log.
//!
//! Entries are pushed to the head of a single list. Once the list grows
//! past `cap` it is trimmed to the `keep` most recent entries. The log is a
//! lossy audit trail for operators, not a source of truth for retries.

use std::sync::Arc;

use tracing::{info, warn};

use super::task::DeadLetterEntry;
use crate::error::QueueError;
use crate::store::{Keys, OrderedStore};

pub struct DeadLetterStore {
    store: Arc<dyn OrderedStore>,
    key: String,
    cap: usize,
    keep: usize,
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn OrderedStore>, keys: &Keys, cap: usize, keep: usize) -> Self {
        Self {
            store,
            key: keys.dead_letter(),
            cap,
            keep,
        }
    }

    /// Appends an entry, trimming the log if it exceeds its cap.
    pub async fn push(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(entry)?;
        let len = self.store.lpush(&self.key, &serialized).await?;

        if len > self.cap {
            self.store
                .ltrim(&self.key, 0, self.keep as isize - 1)
                .await?;
            info!(
                previous_len = len,
                kept = self.keep,
                "Trimmed dead letter log"
            );
        }

        crate::metrics::MetricsCollector::record_dead_letter(entry.original_queue);
        Ok(())
    }

    /// Most recent entries first, at most `limit`.
    ///
    /// Unreadable entries are skipped.
    pub async fn peek(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .lrange(&self.key, 0, limit as isize - 1)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|data| match serde_json::from_str::<DeadLetterEntry>(data) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable dead letter entry");
                    None
                }
            })
            .collect())
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.llen(&self.key).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{Priority, Task, TaskPayload};
    use crate::store::InMemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn entry(reason: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            task: Task::new(Priority::High, TaskPayload::Notification(json!({}))),
            original_queue: Priority::High,
            failure_reason: reason.to_string(),
            stack_trace: None,
            dead_lettered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_push_and_peek_most_recent_first() {
        let store: Arc<dyn OrderedStore> = Arc::new(InMemoryStore::new());
        let dlq = DeadLetterStore::new(store, &Keys::default(), 1000, 500);

        dlq.push(&entry("first")).await.unwrap();
        dlq.push(&entry("second")).await.unwrap();

        let entries = dlq.peek(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].failure_reason, "second");
        assert_eq!(entries[1].failure_reason, "first");
        assert!(dlq.peek(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trims_to_most_recent_when_cap_exceeded() {
        let store = Arc::new(InMemoryStore::new());
        let keys = Keys::default();
        for i in 0..1001 {
            store
                .lpush(&keys.dead_letter(), &format!("seed-{}", i))
                .await
                .unwrap();
        }

        let dlq = DeadLetterStore::new(store.clone(), &keys, 1000, 500);
        dlq.push(&entry("newest")).await.unwrap();

        assert_eq!(dlq.len().await.unwrap(), 500);
        let raw = store.lrange(&keys.dead_letter(), 0, -1).await.unwrap();
        assert!(raw[0].contains("newest"));
        // Newest entry plus seeds 1000 down to 502
        assert_eq!(raw[1], "seed-1000");
        assert_eq!(raw[499], "seed-502");
    }

    #[tokio::test]
    async fn test_peek_skips_unreadable_entries() {
        let store = Arc::new(InMemoryStore::new());
        let keys = Keys::default();
        store.lpush(&keys.dead_letter(), "not json").await.unwrap();

        let dlq = DeadLetterStore::new(store, &keys, 1000, 500);
        dlq.push(&entry("readable")).await.unwrap();

        let entries = dlq.peek(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(dlq.len().await.unwrap(), 2);
    }
}
