//! AI image-generation pipeline on top of the priority queue.
//!
//! # Architecture
//!
//! - **Request**: caller-facing [`AiPipelineRequest`] and per-use-case policy
//! - **Quality**: scoring of finished outputs
//! - **Cost**: spend ledger and cost optimization report
//! - **Orchestrator**: selection, submission, quality retries and batching
//!
//! # Pipeline Flow
//!
//! 1. **Selection**: the model selector picks a backend within the use case's budget
//! 2. **Submission**: the request is enqueued at the use case's priority
//! 3. **Execution**: an external worker runs the generation
//! 4. **Assessment**: the output is scored; shortfalls schedule an upgraded retry
//! 5. **Accounting**: quality and spend are folded into the pipeline metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use genqueue::pipeline::{AiPipelineRequest, PipelineOrchestrator, UseCase};
//!
//! let pipeline = PipelineOrchestrator::new(queue);
//! let request = AiPipelineRequest::new("user-42", UseCase::Social)
//!     .with_prompt("portrait in golden hour light")
//!     .with_capability("face-preservation");
//! let task_id = pipeline.submit_ai_task(request).await?;
//! ```

pub mod cost;
pub mod orchestrator;
pub mod quality;
pub mod request;

pub use cost::{CostLedger, CostOptimizationReport, SavingsOpportunity};
pub use orchestrator::{
    AiPipelineMetrics, PipelineOrchestrator, QualityOutcome, QualityRetry, RetryStatus,
    MANUAL_REVIEW_FLOOR,
};
pub use quality::{GenerationOutput, QualityAssessment, QualityAssessor};
pub use request::{AiPipelineRequest, AiQueueConfig, UseCase, UseCaseConfigs};
