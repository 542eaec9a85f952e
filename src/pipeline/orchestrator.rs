//! AI pipeline orchestrator.
//!
//! This module provides the `PipelineOrchestrator` that coordinates:
//! - Model selection and submission of generation tasks
//! - Quality assessment of finished outputs
//! - Upgraded quality retries, dispatched in the background
//! - Batch submission of similar requests as one task
//! - Advisory pipeline metrics and the cost report

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cost::{CostLedger, CostOptimizationReport};
use super::quality::{GenerationOutput, QualityAssessment, QualityAssessor};
use super::request::{AiPipelineRequest, UseCase, UseCaseConfigs};
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::models::{ModelRegistry, ModelSelector};
use crate::scheduler::{
    AiGenerationPayload, BatchGroup, BatchPayload, BatchSettings, Priority, QueueManager, Task,
    TaskMetadata, TaskPayload,
};

/// Score at or below which an output with no retries left goes to manual review.
pub const MANUAL_REVIEW_FLOOR: f64 = 70.0;

/// Timeout granted per request in a batch.
const BATCH_SECONDS_PER_REQUEST: u64 = 60;

/// How long a settled quality retry stays queryable through `retry_status`.
pub const DEFAULT_RETRY_RETENTION: Duration = Duration::from_secs(3600);

/// Most quality retries tracked at once. Pending retries are never evicted.
pub const DEFAULT_RETRY_CAPACITY: usize = 10_000;

const SOURCE_PIPELINE: &str = "ai_pipeline";
const SOURCE_BATCH: &str = "ai_pipeline_batch";

/// Running pipeline metrics kept in the store.
///
/// Updated read-modify-write, so concurrent writers may lose updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiPipelineMetrics {
    #[serde(default)]
    pub generation_count: u64,
    #[serde(default)]
    pub average_quality: f64,
    /// Assessed generations per model.
    #[serde(default)]
    pub model_utilization: BTreeMap<String, u64>,
    #[serde(default)]
    pub costs: CostLedger,
    #[serde(default)]
    pub manual_review_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AiPipelineMetrics {
    /// Folds one assessment into the running figures.
    pub fn record(&mut self, assessment: &QualityAssessment) {
        self.generation_count += 1;
        self.average_quality +=
            (assessment.overall_score - self.average_quality) / self.generation_count as f64;
        *self
            .model_utilization
            .entry(assessment.model_id.clone())
            .or_insert(0) += 1;
        self.costs.record(
            &assessment.model_id,
            assessment.cost,
            assessment.assessed_at.date_naive(),
        );
        self.updated_at = Some(assessment.assessed_at);
    }
}

/// Lifecycle of a quality retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Submitted { task_id: String },
    Failed { reason: String },
}

/// An upgraded request waiting to be resubmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRetry {
    pub id: String,
    /// Task whose output fell short.
    pub source_task_id: String,
    pub request: AiPipelineRequest,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`PipelineOrchestrator::assess_and_handle_quality`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityOutcome {
    pub assessment: QualityAssessment,
    /// Set when an upgraded retry was scheduled.
    pub retry_id: Option<String>,
    pub manual_review: bool,
}

/// Coordinates selection, submission and quality handling for generation
/// requests on top of a [`QueueManager`].
pub struct PipelineOrchestrator {
    queue: Arc<QueueManager>,
    registry: Arc<ModelRegistry>,
    use_cases: Arc<UseCaseConfigs>,
    selector: ModelSelector,
    assessor: QualityAssessor,
    retries: RwLock<HashMap<String, QualityRetry>>,
    retry_retention: Duration,
    retry_capacity: usize,
    retry_tx: mpsc::UnboundedSender<String>,
    retry_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator with the built-in model catalog and use-case
    /// policies.
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self::with_catalog(
            queue,
            Arc::new(ModelRegistry::with_defaults()),
            Arc::new(UseCaseConfigs::default()),
        )
    }

    pub fn with_catalog(
        queue: Arc<QueueManager>,
        registry: Arc<ModelRegistry>,
        use_cases: Arc<UseCaseConfigs>,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            selector: ModelSelector::new(Arc::clone(&registry), Arc::clone(&use_cases)),
            assessor: QualityAssessor::new(Arc::clone(&registry)),
            queue,
            registry,
            use_cases,
            retries: RwLock::new(HashMap::new()),
            retry_retention: DEFAULT_RETRY_RETENTION,
            retry_capacity: DEFAULT_RETRY_CAPACITY,
            retry_tx,
            retry_rx: Mutex::new(retry_rx),
        }
    }

    /// Sets how long settled retries are kept and how many retries are
    /// tracked at most.
    pub fn with_retry_tracking(mut self, retention: Duration, capacity: usize) -> Self {
        self.retry_retention = retention;
        self.retry_capacity = capacity.max(1);
        self
    }

    /// Selects a model for `request` and enqueues a generation task.
    ///
    /// Priority comes from the use case; retries and timeout from its policy.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Selection` when no candidate model is
    /// registered, or `PipelineError::Queue` when the enqueue fails.
    pub async fn submit_ai_task(&self, request: AiPipelineRequest) -> Result<String, PipelineError> {
        let selection = self.selector.select_best_model(&request)?;
        let config = self.use_cases.get(request.use_case);
        let use_case = request.use_case;

        let metadata = TaskMetadata {
            user_id: Some(request.user_id.clone()),
            source: Some(SOURCE_PIPELINE.to_string()),
            model_id: Some(selection.model_id.clone()),
            projected_cost: Some(selection.projected_cost),
            ..Default::default()
        };
        let model_id = selection.model_id.clone();
        let projected_cost = selection.projected_cost;

        let task = Task::new(
            use_case.priority(),
            TaskPayload::AiGeneration(AiGenerationPayload { request, selection }),
        )
        .with_max_retries(config.max_retries)
        .with_timeout(config.timeout)
        .with_metadata(metadata);

        let task_id = self.queue.enqueue(task).await?;

        info!(
            task_id = %task_id,
            use_case = %use_case,
            model_id = %model_id,
            projected_cost = projected_cost,
            "AI task submitted"
        );

        Ok(task_id)
    }

    /// Scores a finished output and decides what happens next.
    ///
    /// Below the use case's threshold with retries left, an upgraded request
    /// is scheduled for resubmission; the assessment is returned either way.
    /// With no retries left, a score at or below [`MANUAL_REVIEW_FLOOR`] is
    /// flagged for manual review.
    pub async fn assess_and_handle_quality(
        &self,
        output: &GenerationOutput,
        request: &AiPipelineRequest,
    ) -> Result<QualityOutcome, PipelineError> {
        let assessment = self.assessor.assess(output, self.queue.clock().now());
        MetricsCollector::record_quality(assessment.overall_score);
        MetricsCollector::record_generation_cost(&assessment.model_id, assessment.cost);

        let config = self.use_cases.get(request.use_case);
        let retries_left = request.retry_count < config.max_retries;

        let mut retry_id = None;
        let mut manual_review = false;
        if !assessment.meets(config.quality_threshold) && retries_left {
            let improved = request.improved();
            info!(
                task_id = %assessment.task_id,
                score = assessment.overall_score,
                threshold = config.quality_threshold,
                next_use_case = %improved.use_case,
                attempt = improved.retry_count,
                "Quality below threshold, scheduling upgraded retry"
            );
            retry_id = Some(self.schedule_retry(&assessment.task_id, improved));
        } else if !retries_left && assessment.overall_score <= MANUAL_REVIEW_FLOOR {
            warn!(
                task_id = %assessment.task_id,
                model_id = %assessment.model_id,
                score = assessment.overall_score,
                retries = request.retry_count,
                "Quality retries exhausted, flagging for manual review"
            );
            manual_review = true;
        }

        self.update_metrics(&assessment, manual_review).await;

        Ok(QualityOutcome {
            assessment,
            retry_id,
            manual_review,
        })
    }

    /// Enqueues `requests` as a single batch task.
    ///
    /// Requests are grouped by (rounded quality threshold, priority). One
    /// model is selected for the whole batch using the strictest threshold
    /// and every requested capability.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::EmptyBatch` for an empty list.
    pub async fn submit_batch(&self, requests: Vec<AiPipelineRequest>) -> Result<String, PipelineError> {
        if requests.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }

        let request_count = requests.len();
        let config = self.use_cases.get(UseCase::Batch);

        let max_quality_threshold = requests
            .iter()
            .map(|r| r.quality_threshold)
            .fold(f64::MIN, f64::max);
        let highest_priority = requests
            .iter()
            .map(|r| r.priority)
            .min()
            .unwrap_or(Priority::Low);
        let capabilities: BTreeSet<String> = requests
            .iter()
            .flat_map(|r| r.capabilities.iter().cloned())
            .collect();

        let selection = self
            .selector
            .select(UseCase::Batch, max_quality_threshold, &capabilities)?;
        let total_projected_cost = selection.projected_cost * request_count as f64;

        let mut grouped: BTreeMap<(i64, Priority), Vec<AiPipelineRequest>> = BTreeMap::new();
        for request in requests {
            let key = (request.quality_threshold.round() as i64, request.priority);
            grouped.entry(key).or_default().push(request);
        }
        let groups: Vec<BatchGroup> = grouped
            .into_iter()
            .map(|((quality_threshold, priority), requests)| BatchGroup {
                quality_threshold,
                priority,
                requests,
            })
            .collect();
        let group_count = groups.len();

        let timeout = config
            .timeout
            .max(Duration::from_secs(BATCH_SECONDS_PER_REQUEST * request_count as u64));
        let metadata = TaskMetadata {
            source: Some(SOURCE_BATCH.to_string()),
            model_id: Some(selection.model_id.clone()),
            projected_cost: Some(total_projected_cost),
            ..Default::default()
        };

        let payload = BatchPayload {
            groups,
            shared: BatchSettings {
                max_quality_threshold,
                highest_priority,
                total_projected_cost,
                request_count,
                selection,
            },
        };
        let task = Task::new(UseCase::Batch.priority(), TaskPayload::BatchProcessing(payload))
            .with_max_retries(config.max_retries)
            .with_timeout(timeout)
            .with_metadata(metadata);

        let task_id = self.queue.enqueue(task).await?;

        info!(
            task_id = %task_id,
            requests = request_count,
            groups = group_count,
            total_projected_cost = total_projected_cost,
            "Batch submitted"
        );

        Ok(task_id)
    }

    /// Current pipeline metrics. A missing or unreadable record reads as empty.
    pub async fn get_ai_pipeline_metrics(&self) -> Result<AiPipelineMetrics, PipelineError> {
        let key = self.queue.keys().pipeline_metrics();
        let Some(raw) = self.queue.store().get(&key).await? else {
            return Ok(AiPipelineMetrics::default());
        };

        match serde_json::from_str(&raw) {
            Ok(metrics) => Ok(metrics),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring malformed pipeline metrics");
                Ok(AiPipelineMetrics::default())
            }
        }
    }

    /// Spend summary with cheaper-model suggestions.
    pub async fn get_cost_optimization_report(&self) -> Result<CostOptimizationReport, PipelineError> {
        let metrics = self.get_ai_pipeline_metrics().await?;
        let today = self.queue.clock().now().date_naive();
        Ok(CostOptimizationReport::build(
            &metrics.costs,
            &metrics.model_utilization,
            &self.registry,
            today,
        ))
    }

    /// Spawns the consumer that resubmits scheduled quality retries.
    ///
    /// While it runs, [`process_pending_retries`](Self::process_pending_retries)
    /// returns 0.
    pub fn spawn_retry_worker(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut retry_rx = self.retry_rx.lock().await;
            info!("Quality retry worker started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Quality retry worker received shutdown signal");
                        break;
                    }
                    received = retry_rx.recv() => match received {
                        Some(retry_id) => self.dispatch_retry(&retry_id).await,
                        None => break,
                    },
                }
            }

            info!("Quality retry worker stopped");
        })
    }

    /// Resubmits every scheduled retry now. Returns how many were handled.
    pub async fn process_pending_retries(&self) -> usize {
        let Ok(mut retry_rx) = self.retry_rx.try_lock() else {
            debug!("Retry worker is running, skipping inline dispatch");
            return 0;
        };

        let mut processed = 0;
        while let Ok(retry_id) = retry_rx.try_recv() {
            self.dispatch_retry(&retry_id).await;
            processed += 1;
        }
        processed
    }

    /// Lifecycle of a scheduled retry. Settled retries are forgotten after
    /// the retention window or when the tracking capacity is reached.
    pub fn retry_status(&self, retry_id: &str) -> Option<QualityRetry> {
        self.read_retries().get(retry_id).cloned()
    }

    /// Number of quality retries currently tracked.
    pub fn tracked_retries(&self) -> usize {
        self.read_retries().len()
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    fn schedule_retry(&self, source_task_id: &str, request: AiPipelineRequest) -> String {
        let now = self.queue.clock().now();
        let retry = QualityRetry {
            id: Uuid::new_v4().to_string(),
            source_task_id: source_task_id.to_string(),
            request,
            status: RetryStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let retry_id = retry.id.clone();

        {
            let mut retries = self.write_retries();
            self.prune_retries(&mut retries, now);
            retries.insert(retry_id.clone(), retry);
        }
        if self.retry_tx.send(retry_id.clone()).is_err() {
            error!(retry_id = %retry_id, "Retry channel closed, retry will not be dispatched");
        }

        retry_id
    }

    /// Drops settled retries past retention, then the oldest settled ones
    /// until there is room for one more.
    fn prune_retries(&self, retries: &mut HashMap<String, QualityRetry>, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.retry_retention)
            .unwrap_or(chrono::Duration::MAX);
        retries.retain(|_, r| r.status == RetryStatus::Pending || now - r.updated_at <= retention);

        if retries.len() < self.retry_capacity {
            return;
        }
        let mut settled: Vec<(DateTime<Utc>, String)> = retries
            .values()
            .filter(|r| r.status != RetryStatus::Pending)
            .map(|r| (r.updated_at, r.id.clone()))
            .collect();
        settled.sort();

        let excess = retries.len() + 1 - self.retry_capacity;
        for (_, id) in settled.into_iter().take(excess) {
            retries.remove(&id);
        }
        debug!(tracked = retries.len(), "Pruned settled quality retries");
    }

    async fn dispatch_retry(&self, retry_id: &str) {
        let request = {
            let retries = self.read_retries();
            match retries.get(retry_id) {
                Some(retry) if retry.status == RetryStatus::Pending => retry.request.clone(),
                Some(_) => return,
                None => {
                    warn!(retry_id = %retry_id, "Unknown quality retry");
                    return;
                }
            }
        };

        let status = match self.submit_ai_task(request).await {
            Ok(task_id) => {
                info!(retry_id = %retry_id, task_id = %task_id, "Quality retry submitted");
                RetryStatus::Submitted { task_id }
            }
            Err(e) => {
                error!(retry_id = %retry_id, error = %e, "Quality retry submission failed");
                RetryStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let now = self.queue.clock().now();
        if let Some(retry) = self.write_retries().get_mut(retry_id) {
            retry.status = status;
            retry.updated_at = now;
        }
    }

    async fn update_metrics(&self, assessment: &QualityAssessment, manual_review: bool) {
        let mut metrics = match self.get_ai_pipeline_metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "Pipeline metrics unavailable, skipping update");
                return;
            }
        };

        metrics.record(assessment);
        if manual_review {
            metrics.manual_review_count += 1;
        }

        let key = self.queue.keys().pipeline_metrics();
        let result = match serde_json::to_string(&metrics) {
            Ok(raw) => self.queue.store().set(&key, &raw).await.map_err(PipelineError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist pipeline metrics");
        }
    }

    fn read_retries(&self) -> RwLockReadGuard<'_, HashMap<String, QualityRetry>> {
        self.retries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_retries(&self) -> RwLockWriteGuard<'_, HashMap<String, QualityRetry>> {
        self.retries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::store::InMemoryStore;

    fn queue_with_clock() -> (Arc<QueueManager>, ManualClock) {
        let clock = ManualClock::default();
        let queue = Arc::new(QueueManager::with_clock(
            Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone()))),
            QueueConfig::default(),
            Arc::new(clock.clone()),
        ));
        (queue, clock)
    }

    fn orchestrator() -> (Arc<PipelineOrchestrator>, Arc<QueueManager>) {
        let (queue, _clock) = queue_with_clock();
        (Arc::new(PipelineOrchestrator::new(Arc::clone(&queue))), queue)
    }

    fn poor_output(task_id: &str) -> GenerationOutput {
        GenerationOutput::new(task_id, "sdxl-turbo", 512, 512)
            .with_prompt_similarity(0.4)
            .with_aesthetic_score(4.0)
            .with_composition_score(40.0)
            .with_cost(0.004, 2100)
    }

    #[tokio::test]
    async fn test_submit_ai_task_uses_use_case_policy() {
        let (pipeline, queue) = orchestrator();
        let request = AiPipelineRequest::new("u-1", UseCase::Social).with_prompt("a lighthouse");

        let task_id = pipeline.submit_ai_task(request.clone()).await.unwrap();
        let task = queue.dequeue(Priority::High).await.unwrap().unwrap();

        assert_eq!(task.id, task_id);
        assert_eq!(task.max_retries, Some(2));
        assert_eq!(task.timeout(), Duration::from_secs(60));
        assert_eq!(task.metadata.user_id.as_deref(), Some("u-1"));
        assert!(task.metadata.model_id.is_some());
        assert!(task.metadata.projected_cost.is_some());
        match task.payload {
            TaskPayload::AiGeneration(payload) => {
                assert_eq!(payload.request, request);
                assert_eq!(Some(payload.selection.model_id), task.metadata.model_id);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_low_quality_schedules_upgraded_retry() {
        let (pipeline, queue) = orchestrator();
        let request = AiPipelineRequest::new("u-1", UseCase::Batch).with_prompt("a cat");

        let outcome = pipeline
            .assess_and_handle_quality(&poor_output("t-1"), &request)
            .await
            .unwrap();
        assert!(outcome.assessment.overall_score < 70.0);
        assert!(!outcome.manual_review);
        let retry_id = outcome.retry_id.unwrap();
        assert_eq!(
            pipeline.retry_status(&retry_id).unwrap().status,
            RetryStatus::Pending
        );

        assert_eq!(pipeline.process_pending_retries().await, 1);

        let retry = pipeline.retry_status(&retry_id).unwrap();
        let RetryStatus::Submitted { task_id } = retry.status else {
            panic!("retry not submitted: {:?}", retry.status);
        };
        assert_eq!(retry.request.use_case, UseCase::Background);
        assert_eq!(retry.request.retry_count, 1);

        // Upgraded to background, served by the medium class
        let task = queue.dequeue(Priority::Medium).await.unwrap().unwrap();
        assert_eq!(task.id, task_id);
    }

    #[tokio::test]
    async fn test_exhausted_retries_flag_manual_review() {
        let (pipeline, _queue) = orchestrator();
        let mut request = AiPipelineRequest::new("u-1", UseCase::Batch);
        request.retry_count = 3;

        let outcome = pipeline
            .assess_and_handle_quality(&poor_output("t-2"), &request)
            .await
            .unwrap();
        assert!(outcome.retry_id.is_none());
        assert!(outcome.manual_review);

        let metrics = pipeline.get_ai_pipeline_metrics().await.unwrap();
        assert_eq!(metrics.manual_review_count, 1);
        assert_eq!(metrics.generation_count, 1);
        assert_eq!(metrics.model_utilization["sdxl-turbo"], 1);
    }

    #[tokio::test]
    async fn test_metrics_track_running_average_and_cost() {
        let (pipeline, _queue) = orchestrator();
        let request = AiPipelineRequest::new("u-1", UseCase::Interactive);

        let good = GenerationOutput::new("t-3", "flux-pro", 1024, 1024)
            .with_prompt_similarity(0.9)
            .with_aesthetic_score(8.0)
            .with_composition_score(70.0)
            .with_cost(0.132, 12_000);
        let outcome = pipeline.assess_and_handle_quality(&good, &request).await.unwrap();
        assert!(outcome.retry_id.is_none());

        let second = GenerationOutput::new("t-4", "flux-pro", 1024, 1024)
            .with_prompt_similarity(1.0)
            .with_aesthetic_score(10.0)
            .with_composition_score(100.0)
            .with_cost(0.132, 12_000);
        pipeline.assess_and_handle_quality(&second, &request).await.unwrap();

        let metrics = pipeline.get_ai_pipeline_metrics().await.unwrap();
        assert_eq!(metrics.generation_count, 2);
        assert!((metrics.average_quality - 93.0).abs() < 1e-9);
        assert!((metrics.costs.total_spend() - 0.264).abs() < 1e-9);

        let report = pipeline.get_cost_optimization_report().await.unwrap();
        assert!((report.today_spend - 0.264).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_submit_batch_groups_requests() {
        let (pipeline, queue) = orchestrator();
        let requests: Vec<_> = (0..12)
            .map(|i| {
                let use_case = if i % 3 == 0 { UseCase::Background } else { UseCase::Batch };
                AiPipelineRequest::new(format!("u-{}", i), use_case)
            })
            .collect();

        let task_id = pipeline.submit_batch(requests).await.unwrap();
        let task = queue.dequeue(Priority::Low).await.unwrap().unwrap();
        assert_eq!(task.id, task_id);
        // 12 × 60 s exceeds the 600 s batch timeout
        assert_eq!(task.timeout(), Duration::from_secs(720));

        let TaskPayload::BatchProcessing(batch) = task.payload else {
            panic!("expected batch payload");
        };
        assert_eq!(batch.groups.len(), 2);
        assert_eq!(batch.shared.request_count, 12);
        assert_eq!(batch.shared.highest_priority, Priority::Medium);
        assert!((batch.shared.max_quality_threshold - 75.0).abs() < f64::EPSILON);
        assert!(
            (batch.shared.total_projected_cost - 12.0 * batch.shared.selection.projected_cost).abs()
                < 1e-9
        );
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let (pipeline, _queue) = orchestrator();
        let err = pipeline.submit_batch(Vec::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyBatch));
    }

    #[tokio::test]
    async fn test_settled_retries_are_bounded_by_capacity() {
        let (queue, clock) = queue_with_clock();
        let pipeline = PipelineOrchestrator::new(queue).with_retry_tracking(DEFAULT_RETRY_RETENTION, 3);
        let request = AiPipelineRequest::new("u-1", UseCase::Batch);

        let mut retry_ids = Vec::new();
        for i in 0..6 {
            clock.advance(Duration::from_secs(1));
            let outcome = pipeline
                .assess_and_handle_quality(&poor_output(&format!("t-{}", i)), &request)
                .await
                .unwrap();
            retry_ids.push(outcome.retry_id.unwrap());
            assert_eq!(pipeline.process_pending_retries().await, 1);
            assert!(pipeline.tracked_retries() <= 3);
        }

        assert_eq!(pipeline.tracked_retries(), 3);
        assert!(pipeline.retry_status(&retry_ids[0]).is_none());
        assert!(pipeline.retry_status(&retry_ids[5]).is_some());
    }

    #[tokio::test]
    async fn test_pending_retries_survive_pruning() {
        let (queue, clock) = queue_with_clock();
        let pipeline = PipelineOrchestrator::new(queue)
            .with_retry_tracking(Duration::from_secs(60), 2);
        let request = AiPipelineRequest::new("u-1", UseCase::Batch);

        let mut retry_ids = Vec::new();
        for i in 0..3 {
            let outcome = pipeline
                .assess_and_handle_quality(&poor_output(&format!("p-{}", i)), &request)
                .await
                .unwrap();
            retry_ids.push(outcome.retry_id.unwrap());
        }
        // Nothing dispatched yet, so nothing may be dropped
        assert_eq!(pipeline.tracked_retries(), 3);

        assert_eq!(pipeline.process_pending_retries().await, 3);
        clock.advance(Duration::from_secs(61));
        let outcome = pipeline
            .assess_and_handle_quality(&poor_output("p-3"), &request)
            .await
            .unwrap();

        // Settled retries past retention are gone, the new one is pending
        assert_eq!(pipeline.tracked_retries(), 1);
        assert!(pipeline.retry_status(&retry_ids[0]).is_none());
        assert_eq!(
            pipeline.retry_status(&outcome.retry_id.unwrap()).unwrap().status,
            RetryStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_retry_worker_dispatches_in_background() {
        let (pipeline, queue) = orchestrator();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = Arc::clone(&pipeline).spawn_retry_worker(shutdown_rx);

        let request = AiPipelineRequest::new("u-1", UseCase::Batch);
        let outcome = pipeline
            .assess_and_handle_quality(&poor_output("t-5"), &request)
            .await
            .unwrap();
        let retry_id = outcome.retry_id.unwrap();

        let mut submitted = false;
        for _ in 0..100 {
            if matches!(
                pipeline.retry_status(&retry_id).map(|r| r.status),
                Some(RetryStatus::Submitted { .. })
            ) {
                submitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(submitted);
        assert!(queue.dequeue(Priority::Medium).await.unwrap().is_some());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
