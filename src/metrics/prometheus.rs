//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by genqueue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all genqueue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task lifecycle events, labeled by event and priority.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by priority.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks waiting, labeled by priority.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently being executed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Tasks moved to the dead letter log, labeled by original priority.
pub static DEAD_LETTERS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Breaker state per dependency (0 closed, 1 half-open, 2 open).
pub static BREAKER_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Distribution of assessed output quality scores.
pub static QUALITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Generation spend in dollars, labeled by model.
pub static GENERATION_COST_DOLLARS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue metrics
    let tasks_total = CounterVec::new(
        Opts::new("genqueue_tasks_total", "Task lifecycle events"),
        &["event", "priority"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "genqueue_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]),
        &["priority"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("genqueue_queue_depth", "Number of tasks waiting"),
        &["priority"],
    )?;

    let jobs_in_progress = Gauge::new(
        "genqueue_jobs_in_progress",
        "Number of tasks currently being executed",
    )?;

    let active_workers = Gauge::new("genqueue_active_workers", "Number of running workers")?;

    let dead_letters_total = CounterVec::new(
        Opts::new("genqueue_dead_letters_total", "Tasks moved to the dead letter log"),
        &["priority"],
    )?;

    // Breaker metrics
    let breaker_state = GaugeVec::new(
        Opts::new(
            "genqueue_circuit_breaker_state",
            "Breaker state per dependency (0 closed, 1 half-open, 2 open)",
        ),
        &["dependency"],
    )?;

    // Pipeline metrics
    let quality_score = Histogram::with_opts(
        prometheus::HistogramOpts::new("genqueue_quality_score", "Distribution of quality scores")
            .buckets(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]),
    )?;

    let generation_cost = CounterVec::new(
        Opts::new("genqueue_generation_cost_dollars", "Generation spend in dollars"),
        &["model"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(dead_letters_total.clone()))?;
    registry.register(Box::new(breaker_state.clone()))?;
    registry.register(Box::new(quality_score.clone()))?;
    registry.register(Box::new(generation_cost.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = DEAD_LETTERS_TOTAL.set(dead_letters_total);
    let _ = BREAKER_STATE.set(breaker_state);
    let _ = QUALITY_SCORE.set(quality_score);
    let _ = GENERATION_COST_DOLLARS.set(generation_cost);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }
}
