//! End-to-end reward scoring for one (image, prompt) pair.
//!
//! load checkpoint → convert to reward model → acquire and preprocess the
//! image → render the conversation → tokenize → forward → scalar.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use crate::conversation::{select_conv_mode, ConversationTemplates};
use crate::device::{parse_dtype, DeviceError};
use crate::loader::{load_pretrained_model, LoadError, LoadRequest};
use crate::models::{ForwardOptions, ModelError, ModelRegistry, TransferMode};
use crate::multimodal::{
    load_image, ImageAcquisitionError, MultimodalInputs, DEFAULT_IMAGE_TOKEN,
    DEFAULT_IM_END_TOKEN, DEFAULT_IM_START_TOKEN,
};
use crate::tokenizer::TokenizerError;

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Image(#[from] ImageAcquisitionError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("unknown conversation template '{0}'")]
    UnknownTemplate(String),
    #[error("model returned no reward")]
    MissingReward,
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Everything one evaluation needs besides the device.
#[derive(Debug, Clone)]
pub struct EvaluateRequest<'a> {
    pub model_path: &'a str,
    pub model_base: Option<&'a str>,
    /// URL or local path.
    pub image: &'a str,
    pub prompt: &'a str,
    /// Template name; chosen from the model name when unset.
    pub conv_mode: Option<&'a str>,
    pub tokenizer_path: Option<&'a Path>,
    pub transfer_mode: TransferMode,
}

impl<'a> EvaluateRequest<'a> {
    pub fn new(model_path: &'a str, image: &'a str, prompt: &'a str) -> Self {
        Self {
            model_path,
            model_base: None,
            image,
            prompt,
            conv_mode: None,
            tokenizer_path: None,
            transfer_mode: TransferMode::default(),
        }
    }
}

/// Render `prompt` as the single user turn of `conv_mode`, image markers
/// first, with an open assistant turn after it.
pub fn build_prompt(
    templates: &ConversationTemplates,
    conv_mode: &str,
    prompt: &str,
) -> Result<String, EvaluateError> {
    let mut conv = templates
        .get(conv_mode)
        .ok_or_else(|| EvaluateError::UnknownTemplate(conv_mode.to_string()))?;
    let text =
        format!("{DEFAULT_IM_START_TOKEN}{DEFAULT_IMAGE_TOKEN}{DEFAULT_IM_END_TOKEN}\n{prompt}");
    let (user, assistant) = (conv.user_role().to_string(), conv.assistant_role().to_string());
    conv.append_message(&user, Some(&text));
    conv.append_message(&assistant, None);
    Ok(conv.get_prompt())
}

/// Score `prompt` against `image_source` with the checkpoint at `model_path`.
pub fn evaluate(
    model_path: &str,
    image_source: &str,
    prompt: &str,
    device: &Device,
) -> Result<f32, EvaluateError> {
    let dtype = parse_dtype("auto", device)?;
    evaluate_with(
        &EvaluateRequest::new(model_path, image_source, prompt),
        &ModelRegistry::builtin(),
        device,
        dtype,
    )
}

pub fn evaluate_with(
    request: &EvaluateRequest,
    registry: &ModelRegistry,
    device: &Device,
    dtype: DType,
) -> Result<f32, EvaluateError> {
    let load = LoadRequest {
        model_path: request.model_path,
        model_base: request.model_base,
        tokenizer_path: request.tokenizer_path,
        device,
        dtype,
    };
    let loaded = load_pretrained_model(&load, registry)?;
    let (model, _report) = loaded.model.into_reward(request.transfer_mode)?;
    let config = model.config();

    let image = load_image(request.image)?;
    let image_size = image.dimensions();
    let pixels = loaded.image_processor.process_images(
        &[image],
        config.image_aspect_ratio,
        model.device(),
        model.dtype(),
    )?;

    let conv_mode = request
        .conv_mode
        .unwrap_or_else(|| select_conv_mode(&loaded.model_name));
    tracing::info!(conv_mode, model = %loaded.model_name, "rendering prompt");
    let prompt = build_prompt(&ConversationTemplates::builtin(), conv_mode, request.prompt)?;

    let ids = loaded
        .tokenizer
        .encode_with_image_token(&prompt, config.image_token_id)?;
    if ids.len() > loaded.context_len {
        tracing::warn!(
            tokens = ids.len(),
            context_len = loaded.context_len,
            "prompt exceeds the model context length"
        );
    }
    let input_ids = Tensor::new(ids.as_slice(), model.device())?.unsqueeze(0)?;

    let inputs = MultimodalInputs::from_ids(input_ids).with_images(pixels, vec![image_size]);
    let output = model.forward(&inputs, &ForwardOptions::default())?;
    let reward = output
        .reward()
        .ok_or(EvaluateError::MissingReward)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .get(0)?
        .to_scalar::<f32>()?;
    tracing::info!(reward, "evaluation complete");
    Ok(reward)
}
