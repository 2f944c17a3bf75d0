//! Shared test utilities for llava-reward-core.
//!
//! Tiny model configurations and an on-disk tiny checkpoint for integration
//! testing.

mod checkpoint;
mod tiny_config;

pub use checkpoint::{write_tiny_checkpoint, TinyCheckpoint};
pub use tiny_config::{
    tiny_clip_config, tiny_llava_config, tiny_llava_model_config, tiny_prompt_ids,
    TINY_BASE_VOCAB, TINY_WORDS,
};
