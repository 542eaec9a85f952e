//! Prometheus metrics for the queue, breakers and the AI pipeline.
//!
//! # Example
//!
//! ```ignore
//! use genqueue::metrics::{export_metrics, init_metrics, MetricsCollector};
//! use genqueue::scheduler::Priority;
//!
//! init_metrics()?;
//! MetricsCollector::record_task_event("enqueued", Priority::High);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
