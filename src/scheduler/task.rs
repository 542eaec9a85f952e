//! Task definitions for the queue.
//!
//! This module defines the core types stored by the queue manager:
//!
//! - `Priority`: the five ordered service classes and their static limits
//! - `Task`: the versioned task record persisted under `task:{id}`
//! - `TaskPayload`: tagged union of type-specific payloads
//! - `DeadLetterEntry`: snapshot of a task that exhausted its retries
//! - `TaskResult`: result persisted under `result:{id}`

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::SmartSuggestion;
use crate::pipeline::AiPipelineRequest;

/// Current version of the serialized task record.
///
/// Records carrying a newer version are treated as malformed by readers.
pub const TASK_SCHEMA_VERSION: u32 = 1;

/// Service class of a task. Lower rank is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

/// Static limits of one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityConfig {
    /// Maximum number of tasks waiting in the class index.
    pub capacity: usize,
    /// Retries granted when a task does not set its own.
    pub max_retries: u32,
    /// Timeout applied when a task does not set its own.
    pub timeout: Duration,
    /// Intended number of concurrent workers for the class.
    pub concurrency: usize,
}

impl Priority {
    /// All classes in service order.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];

    /// Numeric rank, 1 (critical) through 5 (background).
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
            Priority::Background => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }

    pub fn config(self) -> PriorityConfig {
        let (capacity, max_retries, timeout_secs, concurrency) = match self {
            Priority::Critical => (100, 3, 30, 10),
            Priority::High => (500, 3, 60, 8),
            Priority::Medium => (1000, 3, 300, 5),
            Priority::Low => (2000, 2, 600, 3),
            Priority::Background => (5000, 1, 1800, 2),
        };
        PriorityConfig {
            capacity,
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
            concurrency,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Kind of work a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    AiGeneration,
    BatchProcessing,
    ImageProcessing,
    MusicAnalysis,
    Notification,
    DataSync,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::AiGeneration => "ai_generation",
            TaskType::BatchProcessing => "batch_processing",
            TaskType::ImageProcessing => "image_processing",
            TaskType::MusicAnalysis => "music_analysis",
            TaskType::Notification => "notification",
            TaskType::DataSync => "data_sync",
        }
    }

    /// Circuit breaker key guarding the external dependency this kind of
    /// work calls.
    pub fn dependency(self) -> &'static str {
        match self {
            TaskType::AiGeneration | TaskType::BatchProcessing | TaskType::ImageProcessing => {
                "ai_generation"
            }
            TaskType::MusicAnalysis => "spotify_api",
            TaskType::Notification => "notifications",
            TaskType::DataSync => "database",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific task payload.
///
/// Serialized adjacently tagged: `{"type": "ai_generation", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskPayload {
    AiGeneration(AiGenerationPayload),
    BatchProcessing(BatchPayload),
    ImageProcessing(Value),
    MusicAnalysis(Value),
    Notification(Value),
    DataSync(Value),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::AiGeneration(_) => TaskType::AiGeneration,
            TaskPayload::BatchProcessing(_) => TaskType::BatchProcessing,
            TaskPayload::ImageProcessing(_) => TaskType::ImageProcessing,
            TaskPayload::MusicAnalysis(_) => TaskType::MusicAnalysis,
            TaskPayload::Notification(_) => TaskType::Notification,
            TaskPayload::DataSync(_) => TaskType::DataSync,
        }
    }
}

/// A single generation request together with the model chosen for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiGenerationPayload {
    pub request: AiPipelineRequest,
    pub selection: SmartSuggestion,
}

/// Requests sharing a quality threshold and priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchGroup {
    /// Quality threshold rounded to an integer.
    pub quality_threshold: i64,
    pub priority: Priority,
    pub requests: Vec<AiPipelineRequest>,
}

/// Settings precomputed once for a whole batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSettings {
    pub max_quality_threshold: f64,
    pub highest_priority: Priority,
    pub total_projected_cost: f64,
    pub request_count: usize,
    pub selection: SmartSuggestion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchPayload {
    pub groups: Vec<BatchGroup>,
    pub shared: BatchSettings,
}

/// Lifecycle timestamps, each set once the task reaches that stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskTimestamps {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<DateTime<Utc>>,
}

/// Caller identity, origin and diagnostic fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Overrides the breaker key derived from the payload type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected_cost: Option<f64>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_schema_version() -> u32 {
    TASK_SCHEMA_VERSION
}

/// A unit of work tracked by the queue.
///
/// `max_retries` and `timeout_ms` may be left unset by the submitter; the
/// queue fills them from the priority class on enqueue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub priority: Priority,
    pub payload: TaskPayload,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub timestamps: TaskTimestamps,
    #[serde(default)]
    pub metadata: TaskMetadata,
    /// Task ids that should complete first. Not enforced by the queue.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl Task {
    /// Creates a task with a fresh UUID and no overrides.
    ///
    /// `timestamps.created` is provisional; the queue restamps it from its
    /// own clock on enqueue.
    pub fn new(priority: Priority, payload: TaskPayload) -> Self {
        Self {
            schema_version: TASK_SCHEMA_VERSION,
            id: Uuid::new_v4().to_string(),
            priority,
            payload,
            retries: 0,
            max_retries: None,
            timeout_ms: None,
            timestamps: TaskTimestamps {
                created: Utc::now(),
                ..Default::default()
            },
            metadata: TaskMetadata::default(),
            dependencies: Vec::new(),
        }
    }

    /// Sets the task id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Sets the metadata.
    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the submitting user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    /// Overrides the breaker dependency.
    pub fn with_dependency_name(mut self, dependency: impl Into<String>) -> Self {
        self.metadata.dependency = Some(dependency.into());
        self
    }

    /// Declares a task that should complete before this one.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    /// Breaker key for this task.
    pub fn dependency(&self) -> &str {
        self.metadata
            .dependency
            .as_deref()
            .unwrap_or_else(|| self.task_type().dependency())
    }

    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries
            .unwrap_or_else(|| self.priority.config().max_retries)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.priority.config().timeout)
    }

    /// Returns whether a failure should re-enqueue the task.
    pub fn can_retry(&self) -> bool {
        self.retries < self.effective_max_retries()
    }
}

/// A task that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub task: Task,
    pub original_queue: Priority,
    pub failure_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Result payload stored for a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub data: Value,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sync_task() -> Task {
        Task::new(Priority::Low, TaskPayload::DataSync(json!({"table": "users"})))
    }

    #[test]
    fn test_priority_order_and_rank() {
        let mut shuffled = vec![
            Priority::Background,
            Priority::High,
            Priority::Critical,
            Priority::Low,
            Priority::Medium,
        ];
        shuffled.sort();
        assert_eq!(shuffled, Priority::ALL.to_vec());

        let ranks: Vec<u8> = Priority::ALL.iter().map(|p| p.rank()).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_priority_defaults() {
        let critical = Priority::Critical.config();
        assert_eq!(critical.capacity, 100);
        assert_eq!(critical.max_retries, 3);
        assert_eq!(critical.timeout, Duration::from_secs(30));

        let background = Priority::Background.config();
        assert_eq!(background.capacity, 5000);
        assert_eq!(background.max_retries, 1);
        assert_eq!(background.timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_task_defaults_fall_back_to_priority() {
        let task = sync_task();
        assert_eq!(task.schema_version, TASK_SCHEMA_VERSION);
        assert_eq!(task.effective_max_retries(), 2);
        assert_eq!(task.timeout(), Duration::from_secs(600));
        assert!(task.can_retry());

        let task = sync_task()
            .with_max_retries(0)
            .with_timeout(Duration::from_millis(1500));
        assert_eq!(task.effective_max_retries(), 0);
        assert_eq!(task.timeout_ms, Some(1500));
        assert!(!task.can_retry());
    }

    #[test]
    fn test_dependency_resolution() {
        let task = Task::new(Priority::High, TaskPayload::MusicAnalysis(json!({})));
        assert_eq!(task.dependency(), "spotify_api");

        let task = task.with_dependency_name("lastfm_api");
        assert_eq!(task.dependency(), "lastfm_api");

        assert_eq!(TaskType::BatchProcessing.dependency(), "ai_generation");
        assert_eq!(TaskType::DataSync.dependency(), "database");
    }

    #[test]
    fn test_payload_is_adjacently_tagged() {
        let task = Task::new(
            Priority::Medium,
            TaskPayload::Notification(json!({"channel": "push"})),
        );
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["payload"]["type"], "notification");
        assert_eq!(value["payload"]["data"]["channel"], "push");
        assert_eq!(value["priority"], "medium");
    }

    #[test]
    fn test_metadata_keeps_unknown_fields() {
        let raw = json!({
            "user_id": "u-1",
            "trace_id": "abc123",
        });
        let metadata: TaskMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(metadata.user_id.as_deref(), Some("u-1"));
        assert_eq!(metadata.extra.get("trace_id"), Some(&json!("abc123")));
    }
}
