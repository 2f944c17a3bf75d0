pub mod config;
pub mod conversation;
pub mod device;
pub mod layers;
pub mod loader;
pub mod models;
pub mod multimodal;
pub mod pipeline;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use pipeline::{evaluate, evaluate_with, EvaluateError, EvaluateRequest};
