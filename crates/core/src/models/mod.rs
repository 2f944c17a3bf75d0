pub mod clip;
pub mod llama;
pub mod llava;
pub mod projector;
pub mod registry;
pub mod reward;
pub mod transfer;

use thiserror::Error;

pub use clip::{ClipVisionConfig, ClipVisionTower, VisionSelectFeature};
pub use llama::{BodyOutput, LlamaModel};
pub use llava::{LlavaConfig, LlavaForCausalLM, LlavaLlamaModel, VisionTowerConfig};
pub use projector::{MultimodalProjector, ProjectorType};
pub use registry::{ModelRegistry, PretrainedModel};
pub use reward::{
    ForwardOptions, LlavaRewardModel, OutputField, RewardModelOutput, RewardOutput,
};
pub use transfer::{transfer, TransferMode, TransferPlan, TransferReport};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported model type: {0}")]
    UnsupportedModelType(String),
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("shape mismatch: reward head expects width {expected}, got {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("either input_ids or inputs_embeds must be provided")]
    MissingInputs,
    #[error("found {placeholders} image placeholders but {images} images")]
    ImageCountMismatch { placeholders: usize, images: usize },
    #[error("images were provided but the model has no vision tower")]
    MissingVisionTower,
    #[error("strict transfer rejected {} parameters absent from the target: {}", .0.len(), .0.join(", "))]
    StrictTransfer(Vec<String>),
    #[error("parameter {name} has shape {found:?}, target expects {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
