//! Cost- and quality-aware model selection.
//!
//! Every candidate of the request's use case is scored:
//!
//! ```text
//! score = compatibility
//!       + 10                      if projected cost <= budget
//!       + 15 × (requested capabilities present / requested)
//!       - 0.5 × |quality - threshold|
//! ```
//!
//! The highest-scoring candidate within budget wins. When nothing fits the
//! budget the candidate with the lowest projected cost is returned instead,
//! so selection always produces an answer as long as one candidate exists.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::registry::{capability, AiModel, ModelRegistry};
use crate::error::SelectorError;
use crate::pipeline::{AiPipelineRequest, UseCase, UseCaseConfigs};

const BUDGET_BONUS: f64 = 10.0;
const CAPABILITY_WEIGHT: f64 = 15.0;
const QUALITY_GAP_PENALTY: f64 = 0.5;

/// Expected retries for a model meeting / missing the threshold.
const RETRIES_MEETING_THRESHOLD: f64 = 0.1;
const RETRIES_BELOW_THRESHOLD: f64 = 0.5;

/// The selector's recommendation for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartSuggestion {
    pub model_id: String,
    /// Score divided by 100, clamped to 0.0-1.0.
    pub confidence: f64,
    pub reasons: Vec<String>,
    /// Dollars, including expected retry spend.
    pub projected_cost: f64,
    pub projected_quality: f64,
    /// Seconds.
    pub projected_time: f64,
    pub within_budget: bool,
    pub score: f64,
}

/// Scores registry models against use-case policy.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    registry: Arc<ModelRegistry>,
    use_cases: Arc<UseCaseConfigs>,
}

impl ModelSelector {
    pub fn new(registry: Arc<ModelRegistry>, use_cases: Arc<UseCaseConfigs>) -> Self {
        Self {
            registry,
            use_cases,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn use_cases(&self) -> &Arc<UseCaseConfigs> {
        &self.use_cases
    }

    /// Picks the model for `request`.
    ///
    /// # Errors
    ///
    /// Returns `SelectorError::NoCandidates` only when none of the use
    /// case's candidate ids exist in the registry.
    pub fn select_best_model(
        &self,
        request: &AiPipelineRequest,
    ) -> Result<SmartSuggestion, SelectorError> {
        self.select(
            request.use_case,
            request.quality_threshold,
            &request.capabilities,
        )
    }

    /// Picks a model for an explicit use case, threshold and capability set.
    pub fn select(
        &self,
        use_case: UseCase,
        quality_threshold: f64,
        capabilities: &BTreeSet<String>,
    ) -> Result<SmartSuggestion, SelectorError> {
        let config = self.use_cases.get(use_case);

        let scored: Vec<SmartSuggestion> = config
            .candidate_models
            .iter()
            .filter_map(|id| match self.registry.get(id) {
                Some(model) => Some(model),
                None => {
                    warn!(model_id = %id, use_case = %use_case, "Skipping unregistered candidate model");
                    None
                }
            })
            .map(|model| score_model(model, quality_threshold, capabilities, config.cost_budget))
            .collect();

        let best = scored
            .iter()
            .filter(|s| s.within_budget)
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .or_else(|| {
                scored.iter().min_by(|a, b| {
                    a.projected_cost
                        .partial_cmp(&b.projected_cost)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            })
            .cloned()
            .ok_or_else(|| SelectorError::NoCandidates(use_case.to_string()))?;

        debug!(
            use_case = %use_case,
            model_id = %best.model_id,
            score = best.score,
            projected_cost = best.projected_cost,
            within_budget = best.within_budget,
            "Selected model"
        );

        Ok(best)
    }
}

fn score_model(
    model: &AiModel,
    quality_threshold: f64,
    requested: &BTreeSet<String>,
    budget: f64,
) -> SmartSuggestion {
    let mut reasons = Vec::new();

    let expected_retries = if model.quality >= quality_threshold {
        RETRIES_MEETING_THRESHOLD
    } else {
        RETRIES_BELOW_THRESHOLD
    };
    let projected_cost = model.unit_cost() * (1.0 + model.retry_cost_multiplier * expected_retries);
    let within_budget = projected_cost <= budget;

    let capability_fraction = if requested.is_empty() {
        1.0
    } else {
        let matched = requested.iter().filter(|tag| model.has_capability(tag)).count();
        matched as f64 / requested.len() as f64
    };

    let mut score = model.compatibility_score;
    if within_budget {
        score += BUDGET_BONUS;
        reasons.push(format!(
            "Projected cost ${:.4} within budget ${:.2}",
            projected_cost, budget
        ));
    } else {
        reasons.push(format!(
            "Projected cost ${:.4} exceeds budget ${:.2}",
            projected_cost, budget
        ));
    }
    score += CAPABILITY_WEIGHT * capability_fraction;
    if !requested.is_empty() {
        reasons.push(format!(
            "Supports {:.0}% of requested capabilities",
            capability_fraction * 100.0
        ));
    }
    score -= QUALITY_GAP_PENALTY * (model.quality - quality_threshold).abs();
    if model.quality >= quality_threshold {
        reasons.push(format!(
            "Quality {:.0} meets threshold {:.0}",
            model.quality, quality_threshold
        ));
    }

    let requested_and_present =
        |tag: &str| requested.contains(tag) && model.has_capability(tag);

    let mut projected_quality = model.quality;
    if requested_and_present(capability::POSE_ESTIMATION) {
        projected_quality += 5.0;
        reasons.push("Specialized for pose estimation".to_string());
    }
    if requested_and_present(capability::FACE_PRESERVATION) {
        projected_quality += 3.0;
        reasons.push("Preserves facial identity".to_string());
    }

    let mut projected_time = model.estimated_time;
    if requested_and_present(capability::POSE_ESTIMATION) {
        projected_time += 2.0;
    }
    if requested_and_present(capability::UPSCALING) {
        projected_time += 1.5;
    }
    if model.has_capability(capability::FAST_INFERENCE) {
        projected_time -= 0.5;
        reasons.push("Fast inference".to_string());
    }

    SmartSuggestion {
        model_id: model.id.clone(),
        confidence: (score / 100.0).clamp(0.0, 1.0),
        reasons,
        projected_cost,
        projected_quality: projected_quality.min(100.0),
        projected_time: projected_time.max(0.0),
        within_budget,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AiQueueConfig;

    fn selector() -> ModelSelector {
        ModelSelector::new(
            Arc::new(ModelRegistry::with_defaults()),
            Arc::new(UseCaseConfigs::default()),
        )
    }

    #[test]
    fn test_interactive_prefers_flux_pro() {
        let request = AiPipelineRequest::new("u-1", UseCase::Interactive);
        let suggestion = selector().select_best_model(&request).unwrap();

        // flux-pro: 78 + 10 + 15 - 0.5 × 8 = 99
        assert_eq!(suggestion.model_id, "flux-pro");
        assert!((suggestion.score - 99.0).abs() < 1e-9);
        assert!((suggestion.confidence - 0.99).abs() < 1e-9);
        // 0.011 × 12 × (1 + 1.5 × 0.1)
        assert!((suggestion.projected_cost - 0.1518).abs() < 1e-9);
        assert!(suggestion.within_budget);
    }

    #[test]
    fn test_pose_request_projections() {
        let request = AiPipelineRequest::new("u-1", UseCase::Social)
            .with_capability(capability::POSE_ESTIMATION)
            .with_capability(capability::FACE_PRESERVATION);
        let suggestion = selector().select_best_model(&request).unwrap();

        // controlnet-openpose: 68 + 10 + 15 - 0.5 × 4 = 91
        assert_eq!(suggestion.model_id, "controlnet-openpose");
        assert!((suggestion.projected_quality - 92.0).abs() < 1e-9);
        assert!((suggestion.projected_time - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_capabilities_still_returns_suggestion() {
        let request = AiPipelineRequest::new("u-1", UseCase::Batch).with_capability("video-generation");
        let suggestion = selector().select_best_model(&request).unwrap();
        assert!(!suggestion.model_id.is_empty());
    }

    #[test]
    fn test_falls_back_to_cheapest_when_over_budget() {
        let tight = AiQueueConfig {
            cost_budget: 0.001,
            ..AiQueueConfig::for_use_case(UseCase::Interactive)
        };
        let selector = ModelSelector::new(
            Arc::new(ModelRegistry::with_defaults()),
            Arc::new(UseCaseConfigs::default().with_config(UseCase::Interactive, tight)),
        );

        let suggestion = selector
            .select_best_model(&AiPipelineRequest::new("u-1", UseCase::Interactive))
            .unwrap();
        // sdxl-base: 0.004 × 8 × (1 + 0.5) is the cheapest interactive candidate
        assert_eq!(suggestion.model_id, "sdxl-base");
        assert!(!suggestion.within_budget);
    }

    #[test]
    fn test_unknown_candidates_are_skipped() {
        let config = AiQueueConfig {
            candidate_models: vec!["imagen-9".to_string(), "sdxl-turbo".to_string()],
            ..AiQueueConfig::for_use_case(UseCase::Batch)
        };
        let selector = ModelSelector::new(
            Arc::new(ModelRegistry::with_defaults()),
            Arc::new(UseCaseConfigs::default().with_config(UseCase::Batch, config)),
        );
        let suggestion = selector
            .select_best_model(&AiPipelineRequest::new("u-1", UseCase::Batch))
            .unwrap();
        assert_eq!(suggestion.model_id, "sdxl-turbo");
    }

    #[test]
    fn test_no_registered_candidates_is_an_error() {
        let selector = ModelSelector::new(
            Arc::new(ModelRegistry::new()),
            Arc::new(UseCaseConfigs::default()),
        );
        let err = selector
            .select_best_model(&AiPipelineRequest::new("u-1", UseCase::Social))
            .unwrap_err();
        assert!(matches!(err, SelectorError::NoCandidates(_)));
    }
}
