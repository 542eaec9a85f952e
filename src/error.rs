//! Error types for genqueue operations.
//!
//! Each subsystem owns one error enum:
//! - Ordered store connectivity and command failures
//! - Queue manager admission and serialization failures
//! - Pipeline orchestration (model selection, batching)
//! - Configuration loading and validation
//!
//! Missing or malformed task records are deliberately absent from this
//! taxonomy: the queue resolves them as "task already gone".

use thiserror::Error;

/// Errors raised by an ordered store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected store reply for {command}: {detail}")]
    UnexpectedReply { command: String, detail: String },

    #[error("Store state unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The ordered store could not be reached or rejected a command.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize a task record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The priority index is at its configured capacity.
    #[error("Queue '{priority}' is full ({capacity} tasks)")]
    QueueFull { priority: String, capacity: usize },

    /// The task violates an enqueue precondition.
    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

/// Errors that can occur while selecting a model.
#[derive(Debug, Error)]
pub enum SelectorError {
    /// None of the use case's candidate ids exist in the registry.
    #[error("No candidate models registered for use case '{0}'")]
    NoCandidates(String),
}

/// Errors that can occur in the AI pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Model selection failed: {0}")]
    Selection(#[from] SelectorError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch submission requires at least one request")]
    EmptyBatch,
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::QueueFull {
            priority: "critical".to_string(),
            capacity: 100,
        };
        assert!(err.to_string().contains("critical"));
        assert!(err.to_string().contains("100"));

        let err = QueueError::InvalidTask("empty id".to_string());
        assert!(err.to_string().contains("empty id"));
    }

    #[test]
    fn test_store_error_wraps_into_queue_error() {
        let err: QueueError = StoreError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, QueueError::Store(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_pipeline_error_from_queue_error() {
        let err: PipelineError = QueueError::InvalidTask("dup".to_string()).into();
        assert!(matches!(err, PipelineError::Queue(_)));
        assert!(PipelineError::EmptyBatch.to_string().contains("at least one"));
    }
}
