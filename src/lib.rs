//! genqueue: durable priority task queue for AI image-generation pipelines.
//!
//! This library provides a store-backed priority queue with retries,
//! dead-lettering and per-dependency circuit breakers, plus a cost-aware
//! model selector and pipeline orchestrator built on top of it.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod store;

// Re-export commonly used error types
pub use error::{ConfigError, PipelineError, QueueError, SelectorError, StoreError};
