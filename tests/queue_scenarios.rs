//! End-to-end queue scenarios against the in-memory store.
//!
//! Run with: cargo test --test queue_scenarios

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use genqueue::clock::ManualClock;
use genqueue::config::QueueConfig;
use genqueue::scheduler::{
    CircuitState, Priority, QueueManager, Task, TaskPayload, LEASE_EXPIRED_REASON,
};
use genqueue::store::InMemoryStore;
use serde_json::json;

fn queue_with_clock() -> (Arc<QueueManager>, ManualClock) {
    let clock = ManualClock::default();
    let queue = QueueManager::with_clock(
        Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone()))),
        QueueConfig::default(),
        Arc::new(clock.clone()),
    );
    (Arc::new(queue), clock)
}

fn image_task(priority: Priority) -> Task {
    Task::new(priority, TaskPayload::ImageProcessing(json!({"op": "thumbnail"})))
}

/// Polls every class from the highest down, like a worker does.
async fn next_task(queue: &QueueManager) -> Option<Task> {
    for priority in Priority::ALL {
        if let Some(task) = queue.dequeue(priority).await.unwrap() {
            return Some(task);
        }
    }
    None
}

#[tokio::test]
async fn test_critical_served_before_earlier_low() {
    let (queue, _clock) = queue_with_clock();

    let low = queue.enqueue(image_task(Priority::Low)).await.unwrap();
    let critical = queue.enqueue(image_task(Priority::Critical)).await.unwrap();

    assert_eq!(next_task(&queue).await.unwrap().id, critical);
    assert_eq!(next_task(&queue).await.unwrap().id, low);
    assert!(next_task(&queue).await.is_none());
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let (queue, _clock) = queue_with_clock();

    let mut submitted = Vec::new();
    for _ in 0..5 {
        submitted.push(queue.enqueue(image_task(Priority::High)).await.unwrap());
    }

    let mut served = Vec::new();
    while let Some(task) = queue.dequeue(Priority::High).await.unwrap() {
        served.push(task.id);
    }
    assert_eq!(served, submitted);
}

#[tokio::test]
async fn test_exhausted_retries_end_in_dead_letter_log() {
    let (queue, _clock) = queue_with_clock();
    let id = queue
        .enqueue(image_task(Priority::Medium).with_max_retries(2))
        .await
        .unwrap();

    for attempt in 0..3 {
        let task = queue.dequeue(Priority::Medium).await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.retries, attempt);
        queue.fail_task(&id, "upscaler crashed", Some("at upscale()")).await.unwrap();
    }

    assert!(queue.dequeue(Priority::Medium).await.unwrap().is_none());
    assert!(queue.get_task(&id).await.unwrap().is_none());

    let entries = queue.dead_letters().peek(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task.id, id);
    assert_eq!(entries[0].task.retries, 2);
    assert_eq!(entries[0].original_queue, Priority::Medium);
    assert_eq!(entries[0].failure_reason, "upscaler crashed");
    assert_eq!(entries[0].stack_trace.as_deref(), Some("at upscale()"));
}

#[tokio::test]
async fn test_concurrent_dequeue_never_duplicates() {
    let (queue, _clock) = queue_with_clock();
    for _ in 0..40 {
        queue.enqueue(image_task(Priority::High)).await.unwrap();
    }

    let attempts = (0..60).map(|_| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.dequeue(Priority::High).await.unwrap() })
    });
    let results = join_all(attempts).await;

    let ids: Vec<String> = results
        .into_iter()
        .filter_map(|r| r.unwrap())
        .map(|task| task.id)
        .collect();
    let unique: HashSet<&String> = ids.iter().collect();

    assert_eq!(ids.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test]
async fn test_complete_is_idempotent_and_stores_result() {
    let (queue, _clock) = queue_with_clock();
    let id = queue.enqueue(image_task(Priority::Critical)).await.unwrap();
    queue.dequeue(Priority::Critical).await.unwrap().unwrap();

    queue
        .complete_task(&id, Some(json!({"url": "https://cdn.example/1.png"})))
        .await
        .unwrap();
    queue.complete_task(&id, None).await.unwrap();

    assert!(queue.get_task(&id).await.unwrap().is_none());
    let result = queue.get_result(&id).await.unwrap().unwrap();
    assert_eq!(result.data["url"], "https://cdn.example/1.png");
}

#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let (queue, clock) = queue_with_clock();

    for _ in 0..5 {
        let id = queue
            .enqueue(image_task(Priority::High).with_max_retries(0))
            .await
            .unwrap();
        queue.dequeue(Priority::High).await.unwrap().unwrap();
        queue.fail_task(&id, "provider 503", None).await.unwrap();
    }

    let breakers = queue.breakers();
    assert!(breakers.is_circuit_open("ai_generation").await.unwrap());
    assert_eq!(queue.dead_letters().len().await.unwrap(), 5);

    clock.advance(Duration::from_secs(61));
    assert!(!breakers.is_circuit_open("ai_generation").await.unwrap());
    assert_eq!(
        breakers.state("ai_generation").await.unwrap().state,
        CircuitState::HalfOpen
    );

    assert_eq!(
        breakers.record_success("ai_generation").await.unwrap(),
        CircuitState::HalfOpen
    );
    assert_eq!(
        breakers.record_success("ai_generation").await.unwrap(),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_open_breaker_defers_task_until_half_open() {
    let (queue, clock) = queue_with_clock();
    for _ in 0..5 {
        queue.breakers().record_failure("ai_generation").await.unwrap();
    }

    clock.advance(Duration::from_secs(30));
    let id = queue.enqueue(image_task(Priority::High)).await.unwrap();

    // A worker keeps polling while the breaker stays open
    for _ in 0..5 {
        if let Some(task) = next_task(&queue).await {
            let retry_at = queue.breakers().open_until("ai_generation").await.unwrap().unwrap();
            queue.short_circuit_task(&task.id, "ai_generation", retry_at).await.unwrap();
        }
    }

    let held = queue.get_task(&id).await.unwrap().unwrap();
    assert_eq!(held.retries, 0);
    assert_eq!(queue.deferred_count().await.unwrap(), 1);
    assert_eq!(queue.dead_letters().len().await.unwrap(), 0);

    // Deferral does not count against the breaker, so it still cools down
    clock.advance(Duration::from_secs(31));
    assert!(!queue.breakers().is_circuit_open("ai_generation").await.unwrap());
    assert_eq!(queue.promote_deferred().await.unwrap(), 1);

    let task = next_task(&queue).await.unwrap();
    assert_eq!(task.id, id);
    assert_eq!(task.retries, 0);
}

#[tokio::test]
async fn test_expired_lease_is_reaped_into_retry() {
    let (queue, clock) = queue_with_clock();
    let id = queue
        .enqueue(image_task(Priority::Critical).with_timeout(Duration::from_secs(10)))
        .await
        .unwrap();
    queue.dequeue(Priority::Critical).await.unwrap().unwrap();

    assert_eq!(queue.reap_expired_leases().await.unwrap(), 0);

    // Past the task timeout but inside the lease grace
    clock.advance(Duration::from_secs(11));
    assert_eq!(queue.reap_expired_leases().await.unwrap(), 0);

    clock.advance(queue.config().lease_grace);
    assert_eq!(queue.reap_expired_leases().await.unwrap(), 1);
    assert_eq!(queue.reap_expired_leases().await.unwrap(), 0);

    let task = queue.dequeue(Priority::Critical).await.unwrap().unwrap();
    assert_eq!(task.id, id);
    assert_eq!(task.retries, 1);
    assert_eq!(LEASE_EXPIRED_REASON, "lease expired");
}

#[tokio::test]
async fn test_health_reports_queues_and_breakers() {
    let (queue, _clock) = queue_with_clock();
    queue.enqueue(image_task(Priority::Low)).await.unwrap();
    queue.breakers().record_failure("spotify_api").await.unwrap();

    let report = queue.health_check().await;
    assert!(report.is_healthy());
    assert_eq!(report.details.queues[&Priority::Low].pending, 1);
    assert_eq!(report.details.breakers["spotify_api"].failures, 1);
    assert_eq!(report.details.dead_letters, 0);
}
