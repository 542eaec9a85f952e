//! Quality scoring of generated images.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ModelRegistry;

/// Pixel count that scores a full 100 on resolution.
const REFERENCE_PIXELS: f64 = 1024.0 * 1024.0;

/// Quality assumed for a model missing from the registry.
const UNKNOWN_MODEL_QUALITY: f64 = 50.0;

const RESOLUTION_WEIGHT: f64 = 0.20;
const CONGRUENCY_WEIGHT: f64 = 0.35;
const AESTHETIC_WEIGHT: f64 = 0.30;
const COMPOSITION_WEIGHT: f64 = 0.15;

/// What a generation backend reported for one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub task_id: String,
    pub model_id: String,
    pub width: u32,
    pub height: u32,
    /// Prompt/image similarity, 0.0-1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_similarity: Option<f64>,
    /// Aesthetic predictor output, 0-10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aesthetic_score: Option<f64>,
    /// Composition score, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition_score: Option<f64>,
    /// Dollars actually spent.
    pub cost: f64,
    pub processing_time_ms: u64,
}

impl GenerationOutput {
    pub fn new(task_id: impl Into<String>, model_id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            task_id: task_id.into(),
            model_id: model_id.into(),
            width,
            height,
            prompt_similarity: None,
            aesthetic_score: None,
            composition_score: None,
            cost: 0.0,
            processing_time_ms: 0,
        }
    }

    pub fn with_prompt_similarity(mut self, similarity: f64) -> Self {
        self.prompt_similarity = Some(similarity);
        self
    }

    pub fn with_aesthetic_score(mut self, score: f64) -> Self {
        self.aesthetic_score = Some(score);
        self
    }

    pub fn with_composition_score(mut self, score: f64) -> Self {
        self.composition_score = Some(score);
        self
    }

    pub fn with_cost(mut self, cost: f64, processing_time_ms: u64) -> Self {
        self.cost = cost;
        self.processing_time_ms = processing_time_ms;
        self
    }
}

/// Scored output. All component scores are 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub task_id: String,
    pub model_id: String,
    pub resolution: f64,
    pub content_congruency: f64,
    pub aesthetic_quality: f64,
    pub composition_balance: f64,
    pub overall_score: f64,
    pub cost: f64,
    pub processing_time_ms: u64,
    pub assessed_at: DateTime<Utc>,
}

impl QualityAssessment {
    pub fn meets(&self, threshold: f64) -> bool {
        self.overall_score >= threshold
    }
}

/// Computes [`QualityAssessment`]s, falling back to the model's catalog
/// quality for any signal the backend did not report.
#[derive(Debug, Clone)]
pub struct QualityAssessor {
    registry: Arc<ModelRegistry>,
}

impl QualityAssessor {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn assess(&self, output: &GenerationOutput, assessed_at: DateTime<Utc>) -> QualityAssessment {
        let model_quality = self
            .registry
            .get(&output.model_id)
            .map(|m| m.quality)
            .unwrap_or(UNKNOWN_MODEL_QUALITY);

        let pixels = f64::from(output.width) * f64::from(output.height);
        let resolution = (pixels / REFERENCE_PIXELS * 100.0).min(100.0);
        let content_congruency = output
            .prompt_similarity
            .map(|s| (s * 100.0).clamp(0.0, 100.0))
            .unwrap_or(model_quality);
        let aesthetic_quality = output
            .aesthetic_score
            .map(|s| (s * 10.0).clamp(0.0, 100.0))
            .unwrap_or(model_quality);
        let composition_balance = output
            .composition_score
            .map(|s| s.clamp(0.0, 100.0))
            .unwrap_or(0.9 * model_quality);

        let overall_score = RESOLUTION_WEIGHT * resolution
            + CONGRUENCY_WEIGHT * content_congruency
            + AESTHETIC_WEIGHT * aesthetic_quality
            + COMPOSITION_WEIGHT * composition_balance;

        QualityAssessment {
            task_id: output.task_id.clone(),
            model_id: output.model_id.clone(),
            resolution,
            content_congruency,
            aesthetic_quality,
            composition_balance,
            overall_score,
            cost: output.cost,
            processing_time_ms: output.processing_time_ms,
            assessed_at,
        }
    }
}
