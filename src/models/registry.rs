//! Catalog of image-generation backends.
//!
//! Entries carry pricing, quality and capability information used by the
//! selector and the cost report. The catalog is loaded once at startup and
//! never mutated while requests are served.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Capability tags understood by the selector.
pub mod capability {
    pub const TEXT_TO_IMAGE: &str = "text-to-image";
    pub const IMAGE_TO_IMAGE: &str = "image-to-image";
    pub const INPAINTING: &str = "inpainting";
    pub const STYLE_TRANSFER: &str = "style-transfer";
    pub const POSE_ESTIMATION: &str = "pose-estimation";
    pub const FACE_PRESERVATION: &str = "face-preservation";
    pub const UPSCALING: &str = "upscaling";
    pub const FAST_INFERENCE: &str = "fast-inference";
}

/// Relative latency class of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedClass {
    Fast,
    Medium,
    Slow,
}

impl fmt::Display for SpeedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedClass::Fast => write!(f, "fast"),
            SpeedClass::Medium => write!(f, "medium"),
            SpeedClass::Slow => write!(f, "slow"),
        }
    }
}

/// One backend model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiModel {
    /// Model identifier (e.g., "sdxl-turbo").
    pub id: String,
    pub provider: String,
    /// Dollars per second of generation time.
    pub cost: f64,
    /// Expected output quality, 0-100.
    pub quality: f64,
    pub speed: SpeedClass,
    pub capabilities: BTreeSet<String>,
    pub max_batch_size: usize,
    /// Typical generation time in seconds.
    pub estimated_time: f64,
    /// Share of the base cost paid again per retry.
    pub retry_cost_multiplier: f64,
    /// Baseline fit score, 0-100.
    pub compatibility_score: f64,
}

impl AiModel {
    /// Creates a model with neutral defaults.
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            cost: 0.0,
            quality: 50.0,
            speed: SpeedClass::Medium,
            capabilities: BTreeSet::new(),
            max_batch_size: 1,
            estimated_time: 1.0,
            retry_cost_multiplier: 1.0,
            compatibility_score: 50.0,
        }
    }

    /// Set pricing and typical generation time.
    pub fn with_pricing(mut self, cost_per_second: f64, estimated_time: f64) -> Self {
        self.cost = cost_per_second;
        self.estimated_time = estimated_time;
        self
    }

    /// Set quality, clamped to 0-100.
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality.clamp(0.0, 100.0);
        self
    }

    pub fn with_speed(mut self, speed: SpeedClass) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_retry_cost_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_cost_multiplier = multiplier;
        self
    }

    /// Set compatibility score, clamped to 0-100.
    pub fn with_compatibility_score(mut self, score: f64) -> Self {
        self.compatibility_score = score.clamp(0.0, 100.0);
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    /// Cost of one generation at the typical generation time.
    pub fn unit_cost(&self) -> f64 {
        self.cost * self.estimated_time
    }
}

/// Immutable model catalog keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, AiModel>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in catalog.
    pub fn with_defaults() -> Self {
        use capability::*;

        let mut registry = Self::new();
        registry.register(
            AiModel::new("sdxl-turbo", "stability")
                .with_pricing(0.002, 2.0)
                .with_quality(72.0)
                .with_speed(SpeedClass::Fast)
                .with_capabilities([TEXT_TO_IMAGE, FAST_INFERENCE])
                .with_max_batch_size(8)
                .with_compatibility_score(60.0),
        );
        registry.register(
            AiModel::new("flux-schnell", "replicate")
                .with_pricing(0.003, 4.0)
                .with_quality(80.0)
                .with_speed(SpeedClass::Fast)
                .with_capabilities([TEXT_TO_IMAGE, IMAGE_TO_IMAGE, FAST_INFERENCE])
                .with_max_batch_size(4)
                .with_compatibility_score(70.0),
        );
        registry.register(
            AiModel::new("sdxl-base", "stability")
                .with_pricing(0.004, 8.0)
                .with_quality(82.0)
                .with_capabilities([TEXT_TO_IMAGE, IMAGE_TO_IMAGE, INPAINTING, STYLE_TRANSFER])
                .with_max_batch_size(4)
                .with_compatibility_score(72.0),
        );
        registry.register(
            AiModel::new("controlnet-openpose", "replicate")
                .with_pricing(0.005, 10.0)
                .with_quality(84.0)
                .with_capabilities([IMAGE_TO_IMAGE, POSE_ESTIMATION, FACE_PRESERVATION])
                .with_max_batch_size(2)
                .with_retry_cost_multiplier(1.2)
                .with_compatibility_score(68.0),
        );
        registry.register(
            AiModel::new("flux-pro", "black-forest-labs")
                .with_pricing(0.011, 12.0)
                .with_quality(93.0)
                .with_speed(SpeedClass::Slow)
                .with_capabilities([TEXT_TO_IMAGE, IMAGE_TO_IMAGE, UPSCALING, FACE_PRESERVATION])
                .with_retry_cost_multiplier(1.5)
                .with_compatibility_score(78.0),
        );
        registry.register(
            AiModel::new("dall-e-3", "openai")
                .with_pricing(0.008, 10.0)
                .with_quality(90.0)
                .with_capabilities([TEXT_TO_IMAGE])
                .with_retry_cost_multiplier(1.3)
                .with_compatibility_score(75.0),
        );
        registry
    }

    /// Adds or replaces a model.
    pub fn register(&mut self, model: AiModel) {
        self.models.insert(model.id.clone(), model);
    }

    pub fn get(&self, id: &str) -> Option<&AiModel> {
        self.models.get(id)
    }

    pub fn models(&self) -> impl Iterator<Item = &AiModel> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Cheapest model whose quality is within `tolerance` points of
    /// `model` and whose unit cost is strictly lower.
    pub fn cheaper_alternative(&self, model: &AiModel, tolerance: f64) -> Option<&AiModel> {
        self.models
            .values()
            .filter(|m| m.id != model.id)
            .filter(|m| (m.quality - model.quality).abs() <= tolerance)
            .filter(|m| m.unit_cost() < model.unit_cost())
            .min_by(|a, b| {
                a.unit_cost()
                    .partial_cmp(&b.unit_cost())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let registry = ModelRegistry::with_defaults();
        assert_eq!(registry.len(), 6);

        let turbo = registry.get("sdxl-turbo").unwrap();
        assert_eq!(turbo.speed, SpeedClass::Fast);
        assert!(turbo.has_capability(capability::FAST_INFERENCE));
        assert!((turbo.unit_cost() - 0.004).abs() < 1e-9);

        let pro = registry.get("flux-pro").unwrap();
        assert!((pro.quality - 93.0).abs() < f64::EPSILON);
        assert!(pro.has_capability(capability::UPSCALING));
        assert!(registry.get("midjourney").is_none());
    }

    #[test]
    fn test_builder_clamps() {
        let model = AiModel::new("x", "p")
            .with_quality(140.0)
            .with_compatibility_score(-3.0)
            .with_max_batch_size(0);
        assert!((model.quality - 100.0).abs() < f64::EPSILON);
        assert!((model.compatibility_score - 0.0).abs() < f64::EPSILON);
        assert_eq!(model.max_batch_size, 1);
    }

    #[test]
    fn test_cheaper_alternative() {
        let registry = ModelRegistry::with_defaults();

        // dall-e-3 (q90, $0.08) -> flux-pro is pricier, sdxl-base (q82) too far
        let dalle = registry.get("dall-e-3").unwrap();
        assert!(registry.cheaper_alternative(dalle, 5.0).is_none());

        // sdxl-base (q82, $0.032) -> flux-schnell (q80, $0.012)
        let base = registry.get("sdxl-base").unwrap();
        let alt = registry.cheaper_alternative(base, 5.0).unwrap();
        assert_eq!(alt.id, "flux-schnell");

        // The cheapest model has no cheaper alternative
        let turbo = registry.get("sdxl-turbo").unwrap();
        assert!(registry.cheaper_alternative(turbo, 5.0).is_none());
    }
}
