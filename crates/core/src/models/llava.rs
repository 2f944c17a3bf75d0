//! LLaVA-LLaMA: CLIP vision tower + projector + LLaMA decoder.
//!
//! 1. The vision tower encodes images into patch features
//! 2. The projector maps them to the decoder's hidden width
//! 3. Feature rows replace the `<image>` placeholders in the token sequence
//! 4. The decoder runs over the fused sequence
//!
//! [`LlavaForCausalLM`] adds the `lm_head` generation head on top. It is the
//! shape released checkpoints come in and the source of reward conversion.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder, VarMap};

use super::clip::{ClipVisionConfig, ClipVisionTower, VisionSelectFeature};
use super::llama::{BodyOutput, LlamaModel};
use super::projector::{MultimodalProjector, ProjectorType};
use super::ModelError;
use crate::config::ModelConfig;
use crate::multimodal::{
    fuse_multimodal, FusedInputs, FusionConfig, ImageAspectRatio, MultimodalInputs, PaddingSide,
    IMAGE_TOKEN_INDEX,
};

/// Parameter-name prefix of the vision tower inside a LLaVA checkpoint.
pub const VISION_TOWER_PREFIX: &str = "model.vision_tower";

/// Vision tower identity and architecture.
#[derive(Debug, Clone)]
pub struct VisionTowerConfig {
    /// `mm_vision_tower` as written in the config (hub id or path).
    pub name: String,
    pub clip: ClipVisionConfig,
}

/// A [`ModelConfig`] with every multimodal option resolved and validated.
#[derive(Debug, Clone)]
pub struct LlavaConfig {
    pub model: ModelConfig,
    pub vision_tower: Option<VisionTowerConfig>,
    pub projector_type: ProjectorType,
    pub select_layer: i64,
    pub select_feature: VisionSelectFeature,
    pub image_aspect_ratio: ImageAspectRatio,
    pub use_im_start_end: bool,
    pub use_im_patch_token: bool,
    pub image_token_id: u32,
    pub padding_side: PaddingSide,
}

impl LlavaConfig {
    /// Resolve the optional multimodal fields of `model`.
    ///
    /// `vision` is the tower's own CLIP config; it is required whenever
    /// `mm_vision_tower` is set.
    pub fn new(model: ModelConfig, vision: Option<ClipVisionConfig>) -> Result<Self, ModelError> {
        let projector_type = ProjectorType::parse(model.mm_projector_type.as_deref())
            .ok_or_else(|| {
                ModelError::InvalidConfig(format!(
                    "unknown mm_projector_type `{}`",
                    model.mm_projector_type.as_deref().unwrap_or_default()
                ))
            })?;
        let select_feature = match model.mm_vision_select_feature.as_deref() {
            None => VisionSelectFeature::default(),
            Some(s) => VisionSelectFeature::parse(s).ok_or_else(|| {
                ModelError::InvalidConfig(format!("unknown mm_vision_select_feature `{s}`"))
            })?,
        };

        let vision_tower = match (model.mm_vision_tower.as_deref(), vision) {
            (Some(name), Some(clip)) => Some(VisionTowerConfig {
                name: name.to_string(),
                clip,
            }),
            (None, Some(clip)) => Some(VisionTowerConfig {
                name: "clip".to_string(),
                clip,
            }),
            (Some(name), None) => {
                return Err(ModelError::InvalidConfig(format!(
                    "vision tower `{name}` is configured but its config was not provided"
                )))
            }
            (None, None) => None,
        };
        if let (Some(tower), Some(mm_hidden)) = (&vision_tower, model.mm_hidden_size) {
            if tower.clip.hidden_size != mm_hidden {
                return Err(ModelError::InvalidConfig(format!(
                    "mm_hidden_size {mm_hidden} does not match vision tower width {}",
                    tower.clip.hidden_size
                )));
            }
        }

        Ok(Self {
            projector_type,
            select_layer: model.mm_vision_select_layer.unwrap_or(-2),
            select_feature,
            image_aspect_ratio: ImageAspectRatio::parse(model.image_aspect_ratio.as_deref()),
            use_im_start_end: model.mm_use_im_start_end,
            use_im_patch_token: model.mm_use_im_patch_token,
            image_token_id: model.image_token_index.unwrap_or(IMAGE_TOKEN_INDEX),
            padding_side: PaddingSide::parse(model.tokenizer_padding_side.as_deref()),
            vision_tower,
            model,
        })
    }

    pub fn fusion(&self) -> FusionConfig {
        FusionConfig {
            image_token_id: self.image_token_id,
            max_length: self.model.tokenizer_model_max_length,
            padding_side: self.padding_side,
        }
    }
}

// ─── Shared body ─────────────────────────────────────────────────────────────

/// Everything under the `model.` prefix: decoder, projector and vision tower.
pub struct LlavaLlamaModel {
    body: LlamaModel,
    projector: Option<MultimodalProjector>,
    vision_tower: Option<Arc<ClipVisionTower>>,
    fusion: FusionConfig,
}

impl LlavaLlamaModel {
    /// Build under `vb` (the checkpoint root). A `shared_tower` is attached as
    /// is instead of constructing a new one.
    pub fn new(
        cfg: &LlavaConfig,
        vb: VarBuilder,
        shared_tower: Option<Arc<ClipVisionTower>>,
    ) -> Result<Self, ModelError> {
        let vb_m = vb.pp("model");
        let body = LlamaModel::new(&cfg.model, vb_m.clone())?;

        let vision_tower = match (shared_tower, &cfg.vision_tower) {
            (Some(tower), _) => Some(tower),
            (None, Some(tower_cfg)) => Some(Arc::new(ClipVisionTower::new(
                &tower_cfg.name,
                &tower_cfg.clip,
                cfg.select_layer,
                cfg.select_feature,
                vb_m.pp("vision_tower"),
            )?)),
            (None, None) => None,
        };
        let projector = vision_tower
            .as_ref()
            .map(|tower| {
                MultimodalProjector::new(
                    cfg.projector_type,
                    tower.hidden_size(),
                    cfg.model.hidden_size,
                    vb_m.pp("mm_projector"),
                )
            })
            .transpose()?;

        Ok(Self {
            body,
            projector,
            vision_tower,
            fusion: cfg.fusion(),
        })
    }

    pub fn vision_tower(&self) -> Option<&Arc<ClipVisionTower>> {
        self.vision_tower.as_ref()
    }

    pub fn body(&self) -> &LlamaModel {
        &self.body
    }

    /// `[n, 3, h, w]` pixels → `[n, tokens, hidden]` projected features.
    pub fn encode_images(&self, images: &Tensor) -> Result<Tensor, ModelError> {
        let (Some(tower), Some(projector)) = (&self.vision_tower, &self.projector) else {
            return Err(ModelError::MissingVisionTower);
        };
        let features = tower.forward(images)?;
        let features = projector.forward(&features)?.to_dtype(self.body.dtype())?;
        tracing::debug!(shape = ?features.dims(), "encoded images");
        Ok(features)
    }

    /// Produce the embedding sequence the decoder runs over.
    pub fn prepare_inputs(&self, inputs: &MultimodalInputs) -> Result<FusedInputs, ModelError> {
        if let Some(embeds) = &inputs.inputs_embeds {
            return Ok(FusedInputs {
                inputs_embeds: embeds.clone(),
                attention_mask: inputs.attention_mask.clone(),
                position_ids: inputs.position_ids.clone(),
            });
        }
        let input_ids = inputs.input_ids.as_ref().ok_or(ModelError::MissingInputs)?;
        let features = inputs
            .images
            .as_ref()
            .map(|images| self.encode_images(images))
            .transpose()?;
        fuse_multimodal(
            input_ids,
            inputs.attention_mask.as_ref(),
            inputs.position_ids.as_ref(),
            features.as_ref(),
            |ids| self.body.embed(ids),
            &self.fusion,
        )
    }

    /// Fuse and run the decoder. Returns the fused inputs alongside the
    /// decoder output since pooling needs the re-derived mask.
    pub fn forward(
        &self,
        inputs: &MultimodalInputs,
        output_hidden_states: bool,
        output_attentions: bool,
    ) -> Result<(FusedInputs, BodyOutput), ModelError> {
        let fused = self.prepare_inputs(inputs)?;
        let out = self.body.forward(
            &fused.inputs_embeds,
            fused.attention_mask.as_ref(),
            fused.position_ids.as_ref(),
            output_hidden_states,
            output_attentions,
        )?;
        Ok((fused, out))
    }
}

// ─── Causal LM ───────────────────────────────────────────────────────────────

/// Pretrained LLaVA-LLaMA with its generation head. Owns its parameters.
pub struct LlavaForCausalLM {
    params: VarMap,
    config: LlavaConfig,
    model: LlavaLlamaModel,
    lm_head: Linear,
    device: Device,
    dtype: DType,
}

impl LlavaForCausalLM {
    /// Build with freshly initialized parameters; load weights into
    /// [`Self::params`] afterwards.
    pub fn new(cfg: &LlavaConfig, device: &Device, dtype: DType) -> Result<Self, ModelError> {
        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, dtype, device);
        let model = LlavaLlamaModel::new(cfg, vb.clone(), None)?;
        let lm_head = if cfg.model.tie_word_embeddings {
            Linear::new(model.body().embedding_weight().clone(), None)
        } else {
            linear_no_bias(cfg.model.hidden_size, cfg.model.vocab_size, vb.pp("lm_head"))?
        };
        Ok(Self {
            params,
            config: cfg.clone(),
            model,
            lm_head,
            device: device.clone(),
            dtype,
        })
    }

    /// Next-token logits `[b, s, vocab]` over the fused sequence.
    pub fn forward(&self, inputs: &MultimodalInputs) -> Result<Tensor, ModelError> {
        let (_, out) = self.model.forward(inputs, false, false)?;
        Ok(self.lm_head.forward(&out.last_hidden_state)?)
    }

    pub fn params(&self) -> &VarMap {
        &self.params
    }

    pub fn config(&self) -> &LlavaConfig {
        &self.config
    }

    pub fn model(&self) -> &LlavaLlamaModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
