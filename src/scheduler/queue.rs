//! Priority queue manager.
//!
//! This module provides the queue core shared by all workers:
//!
//! - One sorted-set index per priority class, popped atomically
//! - Task records with a TTL equal to the task timeout
//! - Retry with re-indexing at the same priority
//! - Dead-lettering once retries are exhausted
//! - Leases that return a crashed worker's task to the failure path
//! - Deferral of tasks whose dependency breaker is open
//!
//! # Store Layout
//!
//! - `queue:{priority}`: task ids, score = `rank × 10^12 + seq`
//! - `task:{id}`: serialized [`Task`]
//! - `queue:processing`: leased task ids, score = lease deadline (epoch ms)
//! - `queue:deferred`: task ids held back by an open breaker, score = release time (epoch ms)
//! - `result:{id}`: serialized [`TaskResult`]
//!
//! # Ordering
//!
//! `seq` comes from a store-side counter, so within one priority class
//! tasks are served in submission order. Across classes, callers decide
//! which index to poll; workers normally drain higher classes first.
//!
//! # Leases
//!
//! A dequeued task is leased until `timeout + lease_grace`, so the worker's
//! own timeout always fires first. Its record lives for another grace
//! period beyond that, so the reaper still finds it. An outcome reported for
//! a task that was dequeued but no longer holds a lease is stale (the reaper
//! already handled it) and is ignored.
//!
//! # Missing Records
//!
//! An id popped from an index may point at a record that expired or
//! cannot be parsed. Such drift is logged and treated as "no task"; it is
//! never surfaced as an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerRegistry};
use super::dead_letter::DeadLetterStore;
use super::task::{DeadLetterEntry, Priority, Task, TaskResult, TASK_SCHEMA_VERSION};
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::store::{Keys, OrderedStore, RedisStore};

/// Spacing between priority ranks in the index score.
const RANK_SCALE: f64 = 1e12;

/// Leases claimed per reaper round trip.
const REAP_BATCH: usize = 100;

/// Reason recorded when a lease expires.
pub const LEASE_EXPIRED_REASON: &str = "lease expired";

/// Statistics for one priority class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting in the index.
    pub pending: usize,
    /// Registered workers, best effort.
    pub active_workers: usize,
    pub capacity: usize,
    pub concurrency: usize,
}

impl QueueStats {
    fn empty(priority: Priority) -> Self {
        let config = priority.config();
        Self {
            pending: 0,
            active_workers: 0,
            capacity: config.capacity,
            concurrency: config.concurrency,
        }
    }

    /// Fraction of capacity in use, 0.0 to 1.0.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.pending as f64 / self.capacity as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queues: BTreeMap<Priority, QueueStats>,
    pub breakers: BTreeMap<String, CircuitBreaker>,
    pub dead_letters: usize,
}

/// Result of [`QueueManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub details: HealthDetails,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Public queue API composing the task store, priority indexes, circuit
/// breakers and dead-letter log.
pub struct QueueManager {
    store: Arc<dyn OrderedStore>,
    keys: Keys,
    config: QueueConfig,
    breakers: CircuitBreakerRegistry,
    dead_letters: DeadLetterStore,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    /// Connects to Redis at `config.redis_url` and creates a manager.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Store` if the connection fails.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        let store = RedisStore::connect(&config.redis_url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Creates a manager over an existing store.
    pub fn new(store: Arc<dyn OrderedStore>, config: QueueConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates a manager with an explicit time source.
    pub fn with_clock(
        store: Arc<dyn OrderedStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = Keys::new(config.key_prefix.clone());
        let breakers = CircuitBreakerRegistry::new(
            Arc::clone(&store),
            keys.clone(),
            config.breaker_config(),
            Arc::clone(&clock),
        );
        Self::assemble(store, keys, config, breakers, clock)
    }

    /// Creates a manager with custom breaker overrides.
    pub fn with_breaker_config(
        store: Arc<dyn OrderedStore>,
        config: QueueConfig,
        breaker_config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = Keys::new(config.key_prefix.clone());
        let breakers = CircuitBreakerRegistry::new(
            Arc::clone(&store),
            keys.clone(),
            breaker_config,
            Arc::clone(&clock),
        );
        Self::assemble(store, keys, config, breakers, clock)
    }

    fn assemble(
        store: Arc<dyn OrderedStore>,
        keys: Keys,
        config: QueueConfig,
        breakers: CircuitBreakerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dead_letters = DeadLetterStore::new(
            Arc::clone(&store),
            &keys,
            config.dead_letter_cap,
            config.dead_letter_keep,
        );
        Self {
            store,
            keys,
            config,
            breakers,
            dead_letters,
            clock,
        }
    }

    /// Validates, persists and indexes a new task.
    ///
    /// Unset `max_retries`/`timeout` are filled from the priority class and
    /// `created`/`queued` are stamped from the queue clock. The record is
    /// written set-if-absent, so of two concurrent enqueues of one id only
    /// the first is accepted.
    ///
    /// # Errors
    ///
    /// - `QueueError::InvalidTask` for an empty or already-present id
    /// - `QueueError::QueueFull` when the class index is at capacity
    /// - `QueueError::Store` on connectivity failure
    pub async fn enqueue(&self, mut task: Task) -> Result<String, QueueError> {
        if task.id.trim().is_empty() {
            return Err(QueueError::InvalidTask("task id cannot be empty".to_string()));
        }

        let defaults = task.priority.config();
        let max_retries = *task.max_retries.get_or_insert(defaults.max_retries);
        task.timeout_ms
            .get_or_insert(defaults.timeout.as_millis() as u64);
        task.schema_version = TASK_SCHEMA_VERSION;

        if task.retries > max_retries {
            return Err(QueueError::InvalidTask(format!(
                "retries ({}) exceed max_retries ({})",
                task.retries, max_retries
            )));
        }

        let depth = self.store.zcard(&self.keys.queue(task.priority)).await?;
        if depth >= defaults.capacity {
            warn!(
                priority = %task.priority,
                depth = depth,
                "Rejecting task, queue at capacity"
            );
            return Err(QueueError::QueueFull {
                priority: task.priority.to_string(),
                capacity: defaults.capacity,
            });
        }

        let now = self.clock.now();
        task.timestamps.created = now;
        task.timestamps.queued = Some(now);
        let serialized = serde_json::to_string(&task)?;
        let created = self
            .store
            .set_nx_ex(&self.keys.task(&task.id), &serialized, task.timeout())
            .await?;
        if !created {
            return Err(QueueError::InvalidTask(format!(
                "task {} already exists",
                task.id
            )));
        }
        self.insert_into_index(&task).await?;

        info!(
            task_id = %task.id,
            priority = %task.priority,
            task_type = %task.task_type(),
            "Task enqueued"
        );
        MetricsCollector::record_task_event("enqueued", task.priority);
        MetricsCollector::set_queue_depth(task.priority, depth + 1);

        Ok(task.id)
    }

    /// Pops the next task of `priority`.
    ///
    /// Returns `Ok(None)` when the index is empty or the popped id no longer
    /// has a readable record. A returned task is leased until its timeout
    /// plus the lease grace elapses.
    pub async fn dequeue(&self, priority: Priority) -> Result<Option<Task>, QueueError> {
        let Some((id, _score)) = self.store.zpopmin(&self.keys.queue(priority)).await? else {
            debug!(priority = %priority, "Queue empty");
            return Ok(None);
        };

        let Some(mut task) = self.load(&id).await? else {
            warn!(task_id = %id, priority = %priority, "Dropping index entry without task record");
            return Ok(None);
        };

        let now = self.clock.now();
        task.timestamps.processing = Some(now);

        let timeout = task.timeout();
        let grace = self.config.lease_grace;
        self.persist(&task, timeout + grace + grace).await?;

        let deadline = now.timestamp_millis() + (timeout + grace).as_millis() as i64;
        self.store
            .zadd(&self.keys.processing(), &task.id, deadline as f64)
            .await?;

        debug!(task_id = %task.id, priority = %priority, retries = task.retries, "Task leased");
        MetricsCollector::record_task_event("dequeued", priority);

        Ok(Some(task))
    }

    /// Marks a task completed.
    ///
    /// A missing record is a no-op, so completing twice is safe. A
    /// completion arriving after the lease was reclaimed still counts: the
    /// output exists, so the pending retry is withdrawn.
    pub async fn complete_task(&self, id: &str, result: Option<Value>) -> Result<(), QueueError> {
        let Some(mut task) = self.load(id).await? else {
            debug!(task_id = %id, "Complete ignored, task already gone");
            self.store.zrem(&self.keys.processing(), id).await?;
            return Ok(());
        };

        let held_lease = self.store.zrem(&self.keys.processing(), &task.id).await?;
        if !held_lease && task.timestamps.processing.is_some() {
            let withdrawn = self.store.zrem(&self.keys.queue(task.priority), &task.id).await?
                | self.store.zrem(&self.keys.deferred(), &task.id).await?;
            warn!(
                task_id = %task.id,
                withdrawn_retry = withdrawn,
                "Completion arrived after lease was reclaimed"
            );
        }

        let now = self.clock.now();
        task.timestamps.completed = Some(now);

        if let Some(data) = result {
            let record = TaskResult {
                task_id: task.id.clone(),
                data,
                completed_at: now,
            };
            self.store
                .set_ex(
                    &self.keys.result(&task.id),
                    &serde_json::to_string(&record)?,
                    self.config.result_ttl,
                )
                .await?;
        }

        self.store.del(&self.keys.task(&task.id)).await?;

        if let Err(e) = self.breakers.record_success(task.dependency()).await {
            error!(task_id = %task.id, error = %e, "Failed to update circuit breaker");
        }

        let elapsed_ms = task
            .timestamps
            .processing
            .map(|started| (now - started).num_milliseconds())
            .unwrap_or(0);
        info!(
            task_id = %task.id,
            priority = %task.priority,
            duration_ms = elapsed_ms,
            "Task completed"
        );
        MetricsCollector::record_task_event("completed", task.priority);

        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// Re-indexes the task at the same priority while retries remain,
    /// otherwise moves it to the dead-letter log and deletes its record.
    /// A missing record is a no-op, and so is a failure reported for a
    /// dequeued task whose lease was already reclaimed.
    pub async fn fail_task(
        &self,
        id: &str,
        reason: &str,
        stack_trace: Option<&str>,
    ) -> Result<(), QueueError> {
        let Some(task) = self.release_lease(id).await? else {
            return Ok(());
        };
        self.record_failure(task, reason, stack_trace).await
    }

    /// Holds back a task whose dependency breaker is open until `retry_at`.
    ///
    /// The task is not run, spends no retry and does not count against the
    /// breaker. [`promote_deferred`](Self::promote_deferred) returns it to
    /// its index once `retry_at` has passed.
    pub async fn short_circuit_task(
        &self,
        id: &str,
        dependency: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let Some(task) = self.release_lease(id).await? else {
            return Ok(());
        };

        let now = self.clock.now();
        let delay = (retry_at - now).to_std().unwrap_or_default();
        self.persist(&task, task.timeout() + delay).await?;
        self.store
            .zadd(&self.keys.deferred(), &task.id, retry_at.timestamp_millis() as f64)
            .await?;

        info!(
            task_id = %task.id,
            priority = %task.priority,
            dependency = %dependency,
            retry_at = %retry_at,
            "Circuit open, task deferred"
        );
        MetricsCollector::record_task_event("deferred", task.priority);
        Ok(())
    }

    /// Re-indexes every deferred task whose release time has passed.
    ///
    /// Removing the id from the deferred set is the claim, as with leases.
    ///
    /// # Returns
    ///
    /// The number of tasks returned to their index.
    pub async fn promote_deferred(&self) -> Result<usize, QueueError> {
        let now_ms = self.clock.now().timestamp_millis() as f64;
        let mut promoted = 0;

        loop {
            let due = self
                .store
                .zrange_by_score(&self.keys.deferred(), now_ms, REAP_BATCH)
                .await?;
            let batch_len = due.len();

            for id in due {
                if !self.store.zrem(&self.keys.deferred(), &id).await? {
                    continue;
                }
                match self.load(&id).await? {
                    Some(mut task) => {
                        self.index(&mut task).await?;
                        debug!(task_id = %id, priority = %task.priority, "Deferred task released");
                        promoted += 1;
                    }
                    None => warn!(task_id = %id, "Dropping deferred entry without task record"),
                }
            }

            if batch_len < REAP_BATCH {
                break;
            }
        }

        if promoted > 0 {
            info!(promoted = promoted, "Released deferred tasks");
        }
        Ok(promoted)
    }

    /// Number of tasks currently held back by open breakers.
    pub async fn deferred_count(&self) -> Result<usize, QueueError> {
        Ok(self.store.zcard(&self.keys.deferred()).await?)
    }

    /// Loads `id` and drops its lease.
    ///
    /// `None` when the record is gone, or when the task was dequeued but its
    /// lease is no longer held, i.e. the reaper already handled it.
    async fn release_lease(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let Some(task) = self.load(id).await? else {
            debug!(task_id = %id, "Outcome ignored, task already gone");
            self.store.zrem(&self.keys.processing(), id).await?;
            return Ok(None);
        };

        let held_lease = self.store.zrem(&self.keys.processing(), &task.id).await?;
        if !held_lease && task.timestamps.processing.is_some() {
            warn!(task_id = %task.id, "Ignoring outcome reported without a live lease");
            return Ok(None);
        }
        Ok(Some(task))
    }

    async fn record_failure(
        &self,
        mut task: Task,
        reason: &str,
        stack_trace: Option<&str>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        task.timestamps.failed = Some(now);

        if task.can_retry() {
            task.retries += 1;
            self.index(&mut task).await?;
            warn!(
                task_id = %task.id,
                priority = %task.priority,
                retries = task.retries,
                max_retries = task.effective_max_retries(),
                reason = %reason,
                "Task failed, requeued for retry"
            );
            MetricsCollector::record_task_event("retried", task.priority);
        } else {
            let entry = DeadLetterEntry {
                original_queue: task.priority,
                failure_reason: reason.to_string(),
                stack_trace: stack_trace.map(str::to_string),
                dead_lettered_at: now,
                task: task.clone(),
            };
            self.dead_letters.push(&entry).await?;
            self.store.del(&self.keys.task(&task.id)).await?;
            error!(
                task_id = %task.id,
                priority = %task.priority,
                retries = task.retries,
                reason = %reason,
                "Task exhausted retries, moved to dead letter log"
            );
            MetricsCollector::record_task_event("dead_lettered", task.priority);
        }

        if let Err(e) = self.breakers.record_failure(task.dependency()).await {
            error!(task_id = %task.id, error = %e, "Failed to update circuit breaker");
        }

        Ok(())
    }

    /// Per-class statistics. A class whose store query fails reports zeros.
    pub async fn get_queue_stats(&self) -> BTreeMap<Priority, QueueStats> {
        let mut stats = BTreeMap::new();
        for priority in Priority::ALL {
            let pending = self.store.zcard(&self.keys.queue(priority)).await;
            let workers = self.store.scard(&self.keys.workers(priority)).await;

            let entry = match (pending, workers) {
                (Ok(pending), Ok(active_workers)) => {
                    MetricsCollector::set_queue_depth(priority, pending);
                    QueueStats {
                        pending,
                        active_workers,
                        ..QueueStats::empty(priority)
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(priority = %priority, error = %e, "Queue stats unavailable");
                    QueueStats::empty(priority)
                }
            };
            stats.insert(priority, entry);
        }
        stats
    }

    /// Pings the store and, when reachable, folds in queue statistics,
    /// breaker states and the dead-letter count.
    pub async fn health_check(&self) -> HealthReport {
        let checked_at = self.clock.now();

        if let Err(e) = self.store.ping().await {
            error!(error = %e, "Health check failed");
            return HealthReport {
                status: HealthStatus::Unhealthy,
                checked_at,
                details: HealthDetails {
                    error: Some(e.to_string()),
                    queues: BTreeMap::new(),
                    breakers: BTreeMap::new(),
                    dead_letters: 0,
                },
            };
        }

        let queues = self.get_queue_stats().await;
        let breakers = self.breakers.snapshot().await.unwrap_or_else(|e| {
            warn!(error = %e, "Circuit breaker snapshot unavailable");
            BTreeMap::new()
        });
        let dead_letters = self.dead_letters.len().await.unwrap_or_else(|e| {
            warn!(error = %e, "Dead letter count unavailable");
            0
        });

        HealthReport {
            status: HealthStatus::Healthy,
            checked_at,
            details: HealthDetails {
                error: None,
                queues,
                breakers,
                dead_letters,
            },
        }
    }

    /// Routes every task whose lease deadline has passed through the
    /// failure path of [`fail_task`](Self::fail_task).
    ///
    /// Removing the id from the lease set is the claim: when several
    /// reapers race, only the one whose removal succeeds fails the task.
    ///
    /// # Returns
    ///
    /// The number of leases reclaimed.
    pub async fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        let now_ms = self.clock.now().timestamp_millis() as f64;
        let mut reclaimed = 0;

        loop {
            let expired = self
                .store
                .zrange_by_score(&self.keys.processing(), now_ms, REAP_BATCH)
                .await?;
            let batch_len = expired.len();

            for id in expired {
                if !self.store.zrem(&self.keys.processing(), &id).await? {
                    continue;
                }
                let Some(task) = self.load(&id).await? else {
                    debug!(task_id = %id, "Expired lease without task record");
                    continue;
                };
                warn!(task_id = %id, "Lease expired, failing task");
                self.record_failure(task, LEASE_EXPIRED_REASON, None).await?;
                reclaimed += 1;
            }

            if batch_len < REAP_BATCH {
                break;
            }
        }

        if reclaimed > 0 {
            info!(reclaimed = reclaimed, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    /// Retrieves a stored task result.
    pub async fn get_result(&self, id: &str) -> Result<Option<TaskResult>, QueueError> {
        match self.store.get(&self.keys.result(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Reads a task record without modifying it.
    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, QueueError> {
        self.load(id).await
    }

    /// Adds a worker to the best-effort registration set of `priority`.
    pub async fn register_worker(&self, priority: Priority, worker_id: &str) -> Result<(), QueueError> {
        self.store
            .sadd(&self.keys.workers(priority), worker_id)
            .await?;
        Ok(())
    }

    pub async fn deregister_worker(
        &self,
        priority: Priority,
        worker_id: &str,
    ) -> Result<(), QueueError> {
        self.store
            .srem(&self.keys.workers(priority), worker_id)
            .await?;
        Ok(())
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    pub fn store(&self) -> &Arc<dyn OrderedStore> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Stamps `queued`, persists the record and inserts it into its index.
    async fn index(&self, task: &mut Task) -> Result<(), QueueError> {
        task.timestamps.queued = Some(self.clock.now());
        self.persist(task, task.timeout()).await?;
        self.insert_into_index(task).await
    }

    async fn insert_into_index(&self, task: &Task) -> Result<(), QueueError> {
        let seq = self.store.incr(&self.keys.sequence()).await?;
        let score = f64::from(task.priority.rank()) * RANK_SCALE + seq as f64;
        self.store
            .zadd(&self.keys.queue(task.priority), &task.id, score)
            .await?;
        Ok(())
    }

    async fn persist(&self, task: &Task, ttl: std::time::Duration) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(task)?;
        self.store
            .set_ex(&self.keys.task(&task.id), &serialized, ttl)
            .await?;
        Ok(())
    }

    /// Reads a task record, resolving missing or malformed records to `None`.
    async fn load(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let Some(raw) = self.store.get(&self.keys.task(id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Task>(&raw) {
            Ok(task) if task.schema_version > TASK_SCHEMA_VERSION => {
                warn!(
                    task_id = %id,
                    schema_version = task.schema_version,
                    "Ignoring task record with unsupported schema version"
                );
                Ok(None)
            }
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Ignoring malformed task record");
                Ok(None)
            }
        }
    }
}
