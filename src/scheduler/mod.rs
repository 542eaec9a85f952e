//! Durable priority queue with retry, dead-lettering and circuit breaking.
//!
//! This module provides the queue core:
//!
//! - **QueueManager**: enqueue, dequeue, complete, fail, stats and health
//! - **CircuitBreakerRegistry**: per-dependency breakers kept in the store
//! - **DeadLetterStore**: bounded log of tasks that exhausted their retries
//! - **WorkerPool**: workers polling the queues through a [`TaskExecutor`]
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Submitter   │
//!                      │ (pipeline)   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │ Ordered store│  queue:{priority}, task:{id}
//!                      └──────┬───────┘
//!                             │ dequeue (pop-min)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──── complete / fail ──▶ breakers, dead letters
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use genqueue::config::QueueConfig;
//! use genqueue::scheduler::{Priority, QueueManager, Task, TaskPayload};
//! use serde_json::json;
//!
//! let queue = QueueManager::connect(QueueConfig::from_env()?).await?;
//!
//! let task = Task::new(Priority::High, TaskPayload::Notification(json!({"user": "u-1"})));
//! let id = queue.enqueue(task).await?;
//!
//! if let Some(task) = queue.dequeue(Priority::High).await? {
//!     queue.complete_task(&task.id, None).await?;
//! }
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: pop-minimum on the class index, never duplicated
//! - **Leases**: tasks not completed within their timeout are failed by the reaper
//! - **Dead letter log**: exhausted tasks are kept for diagnosis, capped in size
//! - **Graceful shutdown**: workers finish their current task before stopping

pub mod breaker;
pub mod dead_letter;
pub mod queue;
pub mod task;
pub mod worker_pool;

pub use breaker::{BreakerConfig, BreakerSettings, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use dead_letter::DeadLetterStore;
pub use queue::{HealthDetails, HealthReport, HealthStatus, QueueManager, QueueStats, LEASE_EXPIRED_REASON};
pub use task::{
    AiGenerationPayload, BatchGroup, BatchPayload, BatchSettings, DeadLetterEntry, Priority,
    PriorityConfig, Task, TaskMetadata, TaskPayload, TaskResult, TaskTimestamps, TaskType,
    TASK_SCHEMA_VERSION,
};
pub use worker_pool::{ExecutionError, PoolError, PoolStats, TaskExecutor, WorkerPool, WorkerPoolConfig};
