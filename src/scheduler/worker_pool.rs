//! Worker pool draining the priority queues.
//!
//! Each worker runs as an independent async task that polls the priority
//! indexes from highest to lowest, executes the first task it gets through
//! a [`TaskExecutor`], and reports the outcome back to the queue manager.
//!
//! # Features
//!
//! - Configurable number of workers and polled priority classes
//! - Circuit breaker check before each execution; tasks of an open
//!   dependency are deferred until it half-opens
//! - Per-task timeout enforcement
//! - Periodic reaper for expired leases and due deferred tasks
//! - Graceful shutdown with broadcast channel
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::QueueManager;
use super::task::{Priority, Task};
use crate::config::parse_env_value;
use crate::error::{ConfigError, QueueError};
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Failure reported by a [`TaskExecutor`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    pub stack_trace: Option<String>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Runs the work a task describes.
///
/// Implementations call the external backend (model provider, music API,
/// notification service). A returned value is stored as the task result.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Option<Value>, ExecutionError>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Priority classes polled by every worker, in polling order.
    pub priorities: Vec<Priority>,
    /// How long to sleep when every polled queue is empty.
    pub poll_interval: Duration,
    /// How often to reclaim expired leases.
    pub reaper_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            priorities: Priority::ALL.to_vec(),
            poll_interval: Duration::from_millis(500),
            reaper_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GENQUEUE_WORKERS`: Number of workers (default: 4)
    /// - `GENQUEUE_PRIORITIES`: Comma-separated classes to poll (default: all)
    /// - `GENQUEUE_POLL_INTERVAL_MS`: Idle poll interval (default: 500)
    /// - `GENQUEUE_REAPER_INTERVAL_SECS`: Lease reaper interval (default: 15)
    /// - `GENQUEUE_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown limit (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("GENQUEUE_WORKERS") {
            config.num_workers = parse_env_value(&val, "GENQUEUE_WORKERS")?;
        }

        if let Ok(val) = std::env::var("GENQUEUE_PRIORITIES") {
            config = config.with_priorities(parse_priorities(&val)?);
        }

        if let Ok(val) = std::env::var("GENQUEUE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "GENQUEUE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("GENQUEUE_REAPER_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "GENQUEUE_REAPER_INTERVAL_SECS")?;
            config.reaper_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("GENQUEUE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "GENQUEUE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }
        if self.priorities.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "priorities cannot be empty".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reaper_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the polled priority classes. They are polled in service order.
    pub fn with_priorities(mut self, mut priorities: Vec<Priority>) -> Self {
        priorities.sort();
        priorities.dedup();
        self.priorities = priorities;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the lease reaper interval.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parses a comma-separated list of priority classes.
fn parse_priorities(value: &str) -> Result<Vec<Priority>, ConfigError> {
    value
        .split(',')
        .map(|s| parse_env_value(s, "GENQUEUE_PRIORITIES"))
        .collect()
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a task.
    pub active_workers: usize,
    /// Tasks completed successfully.
    pub tasks_completed: u64,
    /// Tasks that failed or timed out.
    pub tasks_failed: u64,
    /// Tasks deferred because their dependency breaker was open.
    pub tasks_deferred: u64,
    /// Average task execution duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_deferred: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_deferred: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_deferral(&self) {
        self.tasks_deferred.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_deferred: self.tasks_deferred.load(Ordering::SeqCst),
            average_task_duration: average,
        }
    }
}

/// Pool of workers sharing one queue manager and executor.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<QueueManager>,
    executor: Arc<dyn TaskExecutor>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<QueueManager>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            executor,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the lease reaper.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Reclaim work abandoned by a previous run before polling
        match self.queue.reap_expired_leases().await {
            Ok(reclaimed) if reclaimed > 0 => {
                info!(reclaimed = reclaimed, "Reclaimed leases from previous run");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to reclaim expired leases"),
        }
        if let Err(e) = self.queue.promote_deferred().await {
            warn!(error = %e, "Failed to release deferred tasks");
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}-{}", std::process::id(), i),
                queue: Arc::clone(&self.queue),
                executor: Arc::clone(&self.executor),
                shutdown_rx: self.shutdown_tx.subscribe(),
                priorities: self.config.priorities.clone(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
            };
            self.handles.push(tokio::spawn(worker.run()));
        }

        self.handles.push(tokio::spawn(run_reaper(
            Arc::clone(&self.queue),
            self.shutdown_tx.subscribe(),
            self.config.reaper_interval,
        )));

        self.is_running.store(true, Ordering::SeqCst);
        MetricsCollector::set_active_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            priorities = ?self.config.priorities,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the task they are executing before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::set_active_workers(0);

        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }
}

/// Periodically reclaims expired leases and releases due deferred tasks
/// until shutdown.
async fn run_reaper(
    queue: Arc<QueueManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and start() already reaped
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.reap_expired_leases().await {
                    warn!(error = %e, "Lease reaper pass failed");
                }
                if let Err(e) = queue.promote_deferred().await {
                    warn!(error = %e, "Deferred task release failed");
                }
            }
        }
    }

    debug!("Lease reaper stopped");
}

/// A single worker polling the queues.
struct Worker {
    id: String,
    queue: Arc<QueueManager>,
    executor: Arc<dyn TaskExecutor>,
    shutdown_rx: broadcast::Receiver<()>,
    priorities: Vec<Priority>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop.
    ///
    /// After every executed task polling restarts from the highest class.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        self.register().await;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if self.poll_once().await {
                continue;
            }

            debug!(worker_id = %self.id, "No tasks available");
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.deregister().await;
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Executes at most one task. Returns whether a task was found.
    async fn poll_once(&self) -> bool {
        for &priority in &self.priorities {
            match self.queue.dequeue(priority).await {
                Ok(Some(task)) => {
                    self.process_task(task).await;
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        priority = %priority,
                        error = %e,
                        "Failed to dequeue task"
                    );
                    return false;
                }
            }
        }
        false
    }

    async fn process_task(&self, task: Task) {
        let start_time = Instant::now();
        let dependency = task.dependency().to_string();

        match self.queue.breakers().open_until(&dependency).await {
            Ok(Some(retry_at)) => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task.id,
                    dependency = %dependency,
                    "Circuit open, skipping execution"
                );
                if let Err(e) = self
                    .queue
                    .short_circuit_task(&task.id, &dependency, retry_at)
                    .await
                {
                    error!(worker_id = %self.id, task_id = %task.id, error = %e, "Failed to defer task");
                }
                self.stats.record_deferral();
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(dependency = %dependency, error = %e, "Circuit breaker unavailable, executing anyway");
            }
        }

        info!(
            worker_id = %self.id,
            task_id = %task.id,
            priority = %task.priority,
            attempt = task.retries + 1,
            "Processing task"
        );

        self.stats.increment_active();
        MetricsCollector::inc_jobs_in_progress();
        let timeout = task.timeout();
        let outcome = tokio::time::timeout(timeout, self.executor.execute(&task)).await;
        MetricsCollector::dec_jobs_in_progress();
        self.stats.decrement_active();
        let duration = start_time.elapsed();
        MetricsCollector::observe_task_duration(task.priority, duration.as_secs_f64());

        let report = match outcome {
            Ok(Ok(result)) => {
                self.stats.record_completion(duration);
                self.queue.complete_task(&task.id, result).await
            }
            Ok(Err(e)) => {
                self.stats.record_failure(duration);
                warn!(worker_id = %self.id, task_id = %task.id, error = %e, "Task execution failed");
                self.queue
                    .fail_task(&task.id, &e.message, e.stack_trace.as_deref())
                    .await
            }
            Err(_) => {
                self.stats.record_failure(duration);
                warn!(worker_id = %self.id, task_id = %task.id, timeout = ?timeout, "Task timed out");
                let reason = format!("timed out after {}ms", timeout.as_millis());
                self.queue.fail_task(&task.id, &reason, None).await
            }
        };

        if let Err(e) = report {
            error!(
                worker_id = %self.id,
                task_id = %task.id,
                error = %e,
                "Failed to report task outcome"
            );
        }
    }

    async fn register(&self) {
        for &priority in &self.priorities {
            if let Err(e) = self.queue.register_worker(priority, &self.id).await {
                warn!(worker_id = %self.id, error = %e, "Failed to register worker");
            }
        }
    }

    async fn deregister(&self) {
        for &priority in &self.priorities {
            if let Err(e) = self.queue.deregister_worker(priority, &self.id).await {
                warn!(worker_id = %self.id, error = %e, "Failed to deregister worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::scheduler::task::TaskPayload;
    use crate::store::InMemoryStore;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute(&self, task: &Task) -> Result<Option<Value>, ExecutionError> {
            Ok(Some(json!({ "echo": task.id })))
        }
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.priorities, Priority::ALL.to_vec());
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.reaper_interval, Duration::from_secs(15));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_priorities(vec![Priority::Low, Priority::Critical, Priority::Low])
            .with_poll_interval(Duration::from_millis(50))
            .with_reaper_interval(Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.priorities, vec![Priority::Critical, Priority::Low]);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.reaper_interval, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_parsed_priorities_follow_service_order() {
        let parsed = parse_priorities("low, critical,low").unwrap();
        let config = WorkerPoolConfig::default().with_priorities(parsed);
        assert_eq!(config.priorities, vec![Priority::Critical, Priority::Low]);

        assert!(parse_priorities("urgent").is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerPoolConfig::new(0).validate().is_err());
        assert!(WorkerPoolConfig::new(1)
            .with_priorities(Vec::new())
            .validate()
            .is_err());
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            tasks_completed: 80,
            tasks_failed: 20,
            tasks_deferred: 3,
            average_task_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));
        stats.increment_active();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.active_workers, 1);
        assert_eq!(pool_stats.tasks_completed, 2);
        assert_eq!(pool_stats.tasks_failed, 1);
        // (10000 + 20000 + 5000) / 3 = 11666 ms
        assert_eq!(pool_stats.average_task_duration.as_millis(), 11666);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
        let err = ExecutionError::new("provider down").with_stack_trace("frame 0");
        assert_eq!(err.to_string(), "provider down");
    }

    #[tokio::test]
    async fn test_pool_processes_and_shuts_down() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(QueueManager::new(store, QueueConfig::default()));
        let id = queue
            .enqueue(Task::new(Priority::High, TaskPayload::DataSync(json!({}))))
            .await
            .unwrap();

        let config = WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(10));
        let mut pool = WorkerPool::new(config, Arc::clone(&queue), Arc::new(EchoExecutor));
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        let mut result = None;
        for _ in 0..200 {
            result = queue.get_result(&id).await.unwrap();
            if result.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(result.unwrap().data["echo"], id.as_str());

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert_eq!(pool.stats().tasks_completed, 1);

        let stats = queue.get_queue_stats().await;
        assert_eq!(stats[&Priority::High].active_workers, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_defers_instead_of_dead_lettering() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(QueueManager::new(store, QueueConfig::default()));
        for _ in 0..5 {
            queue.breakers().record_failure("ai_generation").await.unwrap();
        }
        let id = queue
            .enqueue(Task::new(Priority::High, TaskPayload::ImageProcessing(json!({}))))
            .await
            .unwrap();

        let config = WorkerPoolConfig::new(1).with_poll_interval(Duration::from_millis(10));
        let mut pool = WorkerPool::new(config, Arc::clone(&queue), Arc::new(EchoExecutor));
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown().await.unwrap();

        let held = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(held.retries, 0);
        assert_eq!(queue.deferred_count().await.unwrap(), 1);
        assert!(queue.dead_letters().peek(10).await.unwrap().is_empty());
        assert!(queue.get_result(&id).await.unwrap().is_none());

        let stats = pool.stats();
        assert_eq!(stats.tasks_deferred, 1);
        assert_eq!(stats.tasks_failed, 0);
        assert!(queue.breakers().is_circuit_open("ai_generation").await.unwrap());
    }
}
