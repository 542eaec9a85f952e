//! Recording helpers over the raw Prometheus metrics.
//!
//! Every helper is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, BREAKER_STATE, DEAD_LETTERS_TOTAL, GENERATION_COST_DOLLARS, JOBS_IN_PROGRESS,
    QUALITY_SCORE, QUEUE_DEPTH, TASKS_TOTAL, TASK_DURATION,
};
use crate::scheduler::{CircuitState, Priority};

/// Consistent labeling for queue, breaker and pipeline metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Record a task lifecycle event ("enqueued", "dequeued", "completed",
    /// "retried", "dead_lettered").
    pub fn record_task_event(event: &str, priority: Priority) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[event, priority.as_str()])
                .inc();
        }

        tracing::trace!(event = event, priority = %priority, "Recorded task event");
    }

    pub fn observe_task_duration(priority: Priority, duration_secs: f64) {
        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[priority.as_str()])
                .observe(duration_secs);
        }
    }

    pub fn set_queue_depth(priority: Priority, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[priority.as_str()])
                .set(depth as f64);
        }
    }

    pub fn record_dead_letter(priority: Priority) {
        if let Some(dead_letters) = DEAD_LETTERS_TOTAL.get() {
            dead_letters.with_label_values(&[priority.as_str()]).inc();
        }
    }

    pub fn record_breaker_state(dependency: &str, state: CircuitState) {
        if let Some(breaker_state) = BREAKER_STATE.get() {
            breaker_state
                .with_label_values(&[dependency])
                .set(state.as_gauge() as f64);
        }

        tracing::trace!(dependency = dependency, state = %state, "Recorded breaker state");
    }

    /// Record an assessed overall quality score (0-100).
    pub fn record_quality(score: f64) {
        if let Some(quality_score) = QUALITY_SCORE.get() {
            quality_score.observe(score);
        }
    }

    /// Record generation spend in dollars. Negative amounts are ignored.
    pub fn record_generation_cost(model: &str, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        if let Some(generation_cost) = GENERATION_COST_DOLLARS.get() {
            generation_cost.with_label_values(&[model]).inc_by(cost);
        }
    }

    pub fn set_active_workers(count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    pub fn inc_jobs_in_progress() {
        if let Some(jobs) = JOBS_IN_PROGRESS.get() {
            jobs.inc();
        }
    }

    pub fn dec_jobs_in_progress() {
        if let Some(jobs) = JOBS_IN_PROGRESS.get() {
            jobs.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_without_init_does_not_panic() {
        MetricsCollector::record_task_event("enqueued", Priority::High);
        MetricsCollector::set_queue_depth(Priority::Low, 3);
        MetricsCollector::record_generation_cost("sdxl-turbo", 0.004);
        MetricsCollector::inc_jobs_in_progress();
        MetricsCollector::dec_jobs_in_progress();
    }

    #[test]
    fn test_recorded_series_are_exported() {
        let _ = init_metrics();

        MetricsCollector::record_task_event("completed", Priority::Critical);
        MetricsCollector::record_breaker_state("spotify_api", CircuitState::Open);
        MetricsCollector::record_quality(82.5);
        MetricsCollector::record_generation_cost("flux-pro", 0.132);

        let text = export_metrics();
        assert!(text.contains("genqueue_tasks_total"));
        assert!(text.contains("genqueue_circuit_breaker_state"));
        assert!(text.contains("spotify_api"));
        assert!(text.contains("genqueue_generation_cost_dollars"));
    }
}
