//! Caller-facing generation requests and per-use-case queue policy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::Priority;

/// Highest quality threshold an upgraded retry may ask for.
pub const MAX_QUALITY_THRESHOLD: f64 = 95.0;

/// Threshold increase applied to each upgraded retry.
pub const RETRY_THRESHOLD_STEP: f64 = 5.0;

/// Product context a request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseCase {
    Interactive,
    Social,
    Background,
    Batch,
}

impl UseCase {
    pub const ALL: [UseCase; 4] = [
        UseCase::Interactive,
        UseCase::Social,
        UseCase::Background,
        UseCase::Batch,
    ];

    /// Queue class serving this use case.
    pub fn priority(self) -> Priority {
        match self {
            UseCase::Interactive => Priority::Critical,
            UseCase::Social => Priority::High,
            UseCase::Background => Priority::Medium,
            UseCase::Batch => Priority::Low,
        }
    }

    /// One step toward `Interactive`, which has the strongest candidates.
    pub fn upgraded(self) -> Self {
        match self {
            UseCase::Batch => UseCase::Background,
            UseCase::Background => UseCase::Social,
            UseCase::Social | UseCase::Interactive => UseCase::Interactive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UseCase::Interactive => "interactive",
            UseCase::Social => "social",
            UseCase::Background => "background",
            UseCase::Batch => "batch",
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UseCase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Ok(UseCase::Interactive),
            "social" => Ok(UseCase::Social),
            "background" => Ok(UseCase::Background),
            "batch" => Ok(UseCase::Batch),
            other => Err(format!("unknown use case '{}'", other)),
        }
    }
}

/// Queue policy for one use case.
#[derive(Debug, Clone, PartialEq)]
pub struct AiQueueConfig {
    /// Intended concurrent generations.
    pub concurrency: usize,
    /// Ceiling on projected cost per generation, in dollars.
    pub cost_budget: f64,
    /// Minimum acceptable overall quality score.
    pub quality_threshold: f64,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Candidate model ids, in preference order.
    pub candidate_models: Vec<String>,
    /// Maximum tasks waiting for this use case.
    pub backlog_limit: usize,
}

impl AiQueueConfig {
    /// Built-in policy for `use_case`.
    pub fn for_use_case(use_case: UseCase) -> Self {
        let (concurrency, cost_budget, quality_threshold, timeout_secs, max_retries, backlog_limit, candidates): (
            usize,
            f64,
            f64,
            u64,
            u32,
            usize,
            &[&str],
        ) = match use_case {
            UseCase::Interactive => (
                10,
                0.50,
                85.0,
                30,
                2,
                100,
                &["flux-pro", "dall-e-3", "sdxl-base", "controlnet-openpose"],
            ),
            UseCase::Social => (
                8,
                0.25,
                80.0,
                60,
                2,
                500,
                &["sdxl-base", "flux-schnell", "controlnet-openpose", "dall-e-3"],
            ),
            UseCase::Background => (
                5,
                0.10,
                75.0,
                300,
                3,
                2000,
                &["flux-schnell", "sdxl-turbo", "sdxl-base"],
            ),
            UseCase::Batch => (3, 0.05, 70.0, 600, 3, 5000, &["sdxl-turbo", "flux-schnell"]),
        };

        Self {
            concurrency,
            cost_budget,
            quality_threshold,
            timeout: Duration::from_secs(timeout_secs),
            max_retries,
            candidate_models: candidates.iter().map(|s| s.to_string()).collect(),
            backlog_limit,
        }
    }
}

/// Policies for every use case.
#[derive(Debug, Clone, PartialEq)]
pub struct UseCaseConfigs {
    interactive: AiQueueConfig,
    social: AiQueueConfig,
    background: AiQueueConfig,
    batch: AiQueueConfig,
}

impl Default for UseCaseConfigs {
    fn default() -> Self {
        Self {
            interactive: AiQueueConfig::for_use_case(UseCase::Interactive),
            social: AiQueueConfig::for_use_case(UseCase::Social),
            background: AiQueueConfig::for_use_case(UseCase::Background),
            batch: AiQueueConfig::for_use_case(UseCase::Batch),
        }
    }
}

impl UseCaseConfigs {
    pub fn get(&self, use_case: UseCase) -> &AiQueueConfig {
        match use_case {
            UseCase::Interactive => &self.interactive,
            UseCase::Social => &self.social,
            UseCase::Background => &self.background,
            UseCase::Batch => &self.batch,
        }
    }

    /// Replaces the policy of one use case.
    pub fn with_config(mut self, use_case: UseCase, config: AiQueueConfig) -> Self {
        match use_case {
            UseCase::Interactive => self.interactive = config,
            UseCase::Social => self.social = config,
            UseCase::Background => self.background = config,
            UseCase::Batch => self.batch = config,
        }
        self
    }
}

/// A generation job as submitted by a caller.
///
/// Never queued directly; the orchestrator wraps it in a task together with
/// the selected model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiPipelineRequest {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Reference image URLs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub use_case: UseCase,
    pub quality_threshold: f64,
    /// Capability tags the chosen model should have.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl AiPipelineRequest {
    /// Creates a request with the use case's default threshold and priority.
    pub fn new(user_id: impl Into<String>, use_case: UseCase) -> Self {
        Self {
            user_id: user_id.into(),
            prompt: None,
            images: Vec::new(),
            use_case,
            quality_threshold: AiQueueConfig::for_use_case(use_case).quality_threshold,
            capabilities: BTreeSet::new(),
            priority: use_case.priority(),
            retry_count: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.images.push(url.into());
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Request for a quality retry: stronger use case, stricter threshold.
    pub fn improved(&self) -> Self {
        let use_case = self.use_case.upgraded();
        Self {
            use_case,
            quality_threshold: (self.quality_threshold + RETRY_THRESHOLD_STEP)
                .min(MAX_QUALITY_THRESHOLD),
            priority: self.priority.min(use_case.priority()),
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}
