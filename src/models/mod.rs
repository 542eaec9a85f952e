//! Model catalog and cost-aware model selection.

pub mod registry;
pub mod selector;

pub use registry::{capability, AiModel, ModelRegistry, SpeedClass};
pub use selector::{ModelSelector, SmartSuggestion};
