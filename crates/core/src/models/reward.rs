//! LLaVA reward model: the LLaVA-LLaMA body without `lm_head`, mean-pooled
//! over the sequence and projected to one scalar per row.
//!
//! Reward head: `Linear(hidden, hidden) -> GELU -> Linear(hidden, 1)` stored as
//! `reward_head.0` / `reward_head.2`.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use super::clip::ClipVisionTower;
use super::llava::{LlavaConfig, LlavaForCausalLM, LlavaLlamaModel, VISION_TOWER_PREFIX};
use super::transfer::{transfer, TransferMode, TransferPlan, TransferReport, LM_HEAD_PREFIX};
use super::ModelError;
use crate::layers::masked_mean;
use crate::multimodal::MultimodalInputs;

pub const REWARD_HEAD_PREFIX: &str = "reward_head";

// ─── Head ────────────────────────────────────────────────────────────────────

struct RewardHead {
    dense: Linear,
    out_proj: Linear,
    in_features: usize,
}

impl RewardHead {
    fn new(hidden_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            dense: linear(hidden_size, hidden_size, vb.pp("0"))?,
            out_proj: linear(hidden_size, 1, vb.pp("2"))?,
            in_features: hidden_size,
        })
    }

    /// `[b, hidden]` → `[b, 1]`.
    fn forward(&self, pooled: &Tensor) -> Result<Tensor, ModelError> {
        let found = pooled.dim(candle_core::D::Minus1)?;
        if found != self.in_features {
            return Err(ModelError::ShapeMismatch {
                expected: self.in_features,
                found,
            });
        }
        let x = self.dense.forward(pooled)?.gelu_erf()?;
        Ok(self.out_proj.forward(&x)?)
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOptions {
    pub output_hidden_states: bool,
    pub output_attentions: bool,
    /// Structured output when true, positional tuple otherwise.
    pub return_dict: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            output_hidden_states: false,
            output_attentions: false,
            return_dict: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewardModelOutput {
    /// `[b, 1]`.
    pub reward: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

/// One element of the positional output form.
#[derive(Debug, Clone)]
pub enum OutputField {
    Reward(Tensor),
    HiddenStates(Vec<Tensor>),
    Attentions(Vec<Tensor>),
}

#[derive(Debug, Clone)]
pub enum RewardOutput {
    Structured(RewardModelOutput),
    /// Reward first, then whichever optional outputs were requested, in
    /// hidden-states, attentions order.
    Tuple(Vec<OutputField>),
}

impl RewardOutput {
    /// The `[b, 1]` reward, read from the same place in either form.
    pub fn reward(&self) -> Option<&Tensor> {
        match self {
            Self::Structured(out) => Some(&out.reward),
            Self::Tuple(fields) => match fields.first() {
                Some(OutputField::Reward(t)) => Some(t),
                _ => None,
            },
        }
    }

    fn from_parts(out: RewardModelOutput, return_dict: bool) -> Self {
        if return_dict {
            return Self::Structured(out);
        }
        let mut fields = vec![OutputField::Reward(out.reward)];
        if let Some(hidden) = out.hidden_states {
            fields.push(OutputField::HiddenStates(hidden));
        }
        if let Some(attn) = out.attentions {
            fields.push(OutputField::Attentions(attn));
        }
        Self::Tuple(fields)
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

pub struct LlavaRewardModel {
    params: VarMap,
    config: LlavaConfig,
    model: LlavaLlamaModel,
    reward_head: RewardHead,
    device: Device,
    dtype: DType,
}

impl LlavaRewardModel {
    /// Build a reward model with fresh parameters everywhere.
    pub fn new(cfg: &LlavaConfig, device: &Device, dtype: DType) -> Result<Self, ModelError> {
        Self::build(cfg, device, dtype, None)
    }

    fn build(
        cfg: &LlavaConfig,
        device: &Device,
        dtype: DType,
        shared_tower: Option<Arc<ClipVisionTower>>,
    ) -> Result<Self, ModelError> {
        let mut config = cfg.clone();
        config.model.use_cache = false;

        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, dtype, device);
        let model = LlavaLlamaModel::new(&config, vb.clone(), shared_tower)?;
        let reward_head = RewardHead::new(config.model.hidden_size, vb.pp(REWARD_HEAD_PREFIX))?;

        Ok(Self {
            params,
            config,
            model,
            reward_head,
            device: device.clone(),
            dtype,
        })
    }

    /// Convert a pretrained causal LM.
    ///
    /// The new model lives on the source's device and dtype. Parameters are
    /// copied by name except `lm_head.*`; the vision tower, if any, is the
    /// source's own instance. The reward head keeps its fresh values.
    pub fn from_pretrained(
        source: &LlavaForCausalLM,
        mode: TransferMode,
    ) -> Result<(Self, TransferReport), ModelError> {
        let shared_tower = source.model().vision_tower().cloned();
        let mut plan = TransferPlan::new(mode).exclude(LM_HEAD_PREFIX);
        if shared_tower.is_some() {
            plan = plan.alias(VISION_TOWER_PREFIX);
        }

        let model = Self::build(
            source.config(),
            source.device(),
            source.dtype(),
            shared_tower,
        )?;
        let report = transfer(source.params(), &model.params, &plan)?;
        report.log();
        Ok((model, report))
    }

    pub fn forward(
        &self,
        inputs: &MultimodalInputs,
        opts: &ForwardOptions,
    ) -> Result<RewardOutput, ModelError> {
        let (fused, body) =
            self.model
                .forward(inputs, opts.output_hidden_states, opts.output_attentions)?;

        let pooled = masked_mean(&body.last_hidden_state, fused.attention_mask.as_ref())?;
        let reward = self.reward_head.forward(&pooled)?;
        tracing::debug!(shape = ?reward.dims(), "reward computed");

        let out = RewardModelOutput {
            reward,
            hidden_states: body.hidden_states,
            attentions: body.attentions,
        };
        Ok(RewardOutput::from_parts(out, opts.return_dict))
    }

    /// Parameters this model owns. Vision tower parameters are only listed
    /// when the tower was built here rather than shared.
    pub fn params(&self) -> &VarMap {
        &self.params
    }

    pub fn config(&self) -> &LlavaConfig {
        &self.config
    }

    pub fn vision_tower(&self) -> Option<&Arc<ClipVisionTower>> {
        self.model.vision_tower()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transfer::named_vars;
    use crate::testing::{tiny_llava_config, tiny_prompt_ids};

    fn text_only_config(hidden_size: usize) -> LlavaConfig {
        let mut model = tiny_llava_config().model;
        model.hidden_size = hidden_size;
        model.intermediate_size = hidden_size * 2;
        model.num_attention_heads = 2;
        model.num_key_value_heads = Some(2);
        model.mm_vision_tower = None;
        model.mm_hidden_size = None;
        LlavaConfig::new(model, None).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn construct_disables_cache_and_registers_head() {
        let cfg = tiny_llava_config();
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        assert!(!model.config().model.use_cache);

        let names = named_vars(model.params());
        assert_eq!(names["reward_head.0.weight"].dims(), &[16, 16]);
        assert_eq!(names["reward_head.2.weight"].dims(), &[1, 16]);
        assert_eq!(names["reward_head.2.bias"].dims(), &[1]);
        assert!(!names.contains_key("lm_head.weight"));
        assert!(model.vision_tower().is_some());
    }

    #[test]
    fn reward_shape_is_batch_by_one() {
        for (batch, hidden) in [(1, 8), (3, 8), (2, 12)] {
            let cfg = text_only_config(hidden);
            let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
            let ids = Tensor::ones((batch, 5), DType::U32, &Device::Cpu).unwrap();
            let out = model
                .forward(&MultimodalInputs::from_ids(ids), &ForwardOptions::default())
                .unwrap();
            assert_eq!(out.reward().unwrap().dims(), &[batch, 1]);
        }
    }

    #[test]
    fn multimodal_forward_produces_one_reward() {
        let cfg = tiny_llava_config();
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let (ids, images) = tiny_prompt_ids(&cfg, &Device::Cpu);
        let mask = ids.ones_like().unwrap();
        let inputs = MultimodalInputs::from_ids(ids)
            .with_attention_mask(mask)
            .with_images(images, vec![(8, 8)]);

        let out = model.forward(&inputs, &ForwardOptions::default()).unwrap();
        let reward: Vec<Vec<f32>> = out.reward().unwrap().to_vec2().unwrap();
        assert_eq!(reward.len(), 1);
        assert!(reward[0][0].is_finite());
    }

    #[test]
    fn missing_mask_pools_full_sequence() {
        let cfg = text_only_config(8);
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let ids = Tensor::new(&[[1u32, 4, 5, 6]], &Device::Cpu).unwrap();

        let unmasked = model
            .forward(&MultimodalInputs::from_ids(ids.clone()), &ForwardOptions::default())
            .unwrap();
        let all_ones = model
            .forward(
                &MultimodalInputs::from_ids(ids.clone()).with_attention_mask(ids.ones_like().unwrap()),
                &ForwardOptions::default(),
            )
            .unwrap();
        let diff = max_abs_diff(unmasked.reward().unwrap(), all_ones.reward().unwrap());
        assert!(diff < 1e-5, "no mask should equal an all-ones mask, diff {diff}");
    }

    #[test]
    fn padding_does_not_change_reward() {
        let cfg = text_only_config(8);
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();

        let short = Tensor::new(&[[1u32, 4, 5]], &Device::Cpu).unwrap();
        let short_mask = Tensor::new(&[[1u32, 1, 1]], &Device::Cpu).unwrap();
        let padded = Tensor::new(&[[1u32, 4, 5, 0, 0]], &Device::Cpu).unwrap();
        let padded_mask = Tensor::new(&[[1u32, 1, 1, 0, 0]], &Device::Cpu).unwrap();

        let a = model
            .forward(
                &MultimodalInputs::from_ids(short).with_attention_mask(short_mask),
                &ForwardOptions::default(),
            )
            .unwrap();
        let b = model
            .forward(
                &MultimodalInputs::from_ids(padded).with_attention_mask(padded_mask),
                &ForwardOptions::default(),
            )
            .unwrap();
        assert!(max_abs_diff(a.reward().unwrap(), b.reward().unwrap()) < 1e-5);
    }

    #[test]
    fn tuple_output_puts_reward_first() {
        let cfg = text_only_config(8);
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let ids = Tensor::ones((2, 3), DType::U32, &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            output_hidden_states: true,
            output_attentions: true,
            return_dict: false,
        };

        let out = model.forward(&MultimodalInputs::from_ids(ids), &opts).unwrap();
        let RewardOutput::Tuple(fields) = &out else {
            panic!("expected tuple output");
        };
        assert_eq!(fields.len(), 3);
        assert!(matches!(fields[0], OutputField::Reward(_)));
        assert!(
            matches!(&fields[1], OutputField::HiddenStates(h) if h.len() == cfg.model.num_hidden_layers + 1)
        );
        assert!(matches!(fields[2], OutputField::Attentions(_)));
        assert_eq!(out.reward().unwrap().dims(), &[2, 1]);
    }

    #[test]
    fn structured_output_carries_optional_fields() {
        let cfg = text_only_config(8);
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let ids = Tensor::ones((1, 3), DType::U32, &Device::Cpu).unwrap();
        let opts = ForwardOptions {
            output_attentions: true,
            ..ForwardOptions::default()
        };
        let out = model.forward(&MultimodalInputs::from_ids(ids), &opts).unwrap();
        let RewardOutput::Structured(out) = out else {
            panic!("expected structured output");
        };
        assert!(out.hidden_states.is_none());
        assert_eq!(out.attentions.unwrap().len(), cfg.model.num_hidden_layers);
    }

    #[test]
    fn head_rejects_wrong_width() {
        let head = RewardHead::new(8, VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap();
        let pooled = Tensor::zeros((2, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            head.forward(&pooled),
            Err(ModelError::ShapeMismatch { expected: 8, found: 6 })
        ));
    }

    #[test]
    fn missing_ids_and_embeds_is_an_error() {
        let cfg = text_only_config(8);
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        assert!(matches!(
            model.forward(&MultimodalInputs::default(), &ForwardOptions::default()),
            Err(ModelError::MissingInputs)
        ));
    }

    #[test]
    fn inputs_embeds_bypass_fusion() {
        let cfg = text_only_config(8);
        let model = LlavaRewardModel::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let embeds = Tensor::randn(0f32, 1.0, (2, 4, 8), &Device::Cpu).unwrap();
        let out = model
            .forward(&MultimodalInputs::from_embeds(embeds), &ForwardOptions::default())
            .unwrap();
        assert_eq!(out.reward().unwrap().dims(), &[2, 1]);
    }

    // ─── Conversion ──────────────────────────────────────────────────────────

    #[test]
    fn conversion_drops_lm_head_and_copies_the_rest() {
        let cfg = tiny_llava_config();
        let source = LlavaForCausalLM::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let (reward, report) =
            LlavaRewardModel::from_pretrained(&source, TransferMode::Strict).unwrap();

        let src = named_vars(source.params());
        let dst = named_vars(reward.params());
        assert!(dst.keys().all(|name| !name.starts_with("lm_head")));
        assert_eq!(report.excluded, vec!["lm_head.weight"]);
        assert!(report.skipped.is_empty());

        for name in &report.copied {
            let a: Vec<f32> = src[name].as_tensor().flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = dst[name].as_tensor().flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a, b, "{name} differs after conversion");
        }
        let mut untouched = report.untouched.clone();
        untouched.sort();
        assert_eq!(
            untouched,
            vec![
                "reward_head.0.bias",
                "reward_head.0.weight",
                "reward_head.2.bias",
                "reward_head.2.weight",
            ]
        );
    }

    #[test]
    fn conversion_shares_the_vision_tower() {
        let cfg = tiny_llava_config();
        let source = LlavaForCausalLM::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let (reward, report) =
            LlavaRewardModel::from_pretrained(&source, TransferMode::Lenient).unwrap();

        let src_tower = source.model().vision_tower().unwrap();
        let dst_tower = reward.vision_tower().unwrap();
        assert!(Arc::ptr_eq(src_tower, dst_tower));
        assert!(report
            .aliased
            .iter()
            .all(|name| name.starts_with("model.vision_tower.")));
        assert!(!report.aliased.is_empty());
        assert!(named_vars(reward.params())
            .keys()
            .all(|name| !name.starts_with("model.vision_tower.")));

        // a write through the source's parameter set is seen by the reward model
        let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let before = dst_tower.forward(&images).unwrap();
        let source_vars = named_vars(source.params());
        let class_embedding =
            &source_vars["model.vision_tower.vision_model.embeddings.class_embedding"];
        class_embedding
            .set(&(class_embedding.as_tensor() + 1.0).unwrap())
            .unwrap();
        let after = reward.vision_tower().unwrap().forward(&images).unwrap();
        assert!(max_abs_diff(&before, &after) > 0.0);
    }

    #[test]
    fn converted_model_scores_on_source_device() {
        let cfg = tiny_llava_config();
        let source = LlavaForCausalLM::new(&cfg, &Device::Cpu, DType::F32).unwrap();
        let (reward, _) = LlavaRewardModel::from_pretrained(&source, TransferMode::Lenient).unwrap();
        assert!(reward.device().same_device(source.device()));
        assert_eq!(reward.dtype(), source.dtype());

        let (ids, images) = tiny_prompt_ids(&cfg, &Device::Cpu);
        let inputs = MultimodalInputs::from_ids(ids).with_images(images, vec![(8, 8)]);
        let out = reward.forward(&inputs, &ForwardOptions::default()).unwrap();
        assert_eq!(out.reward().unwrap().dims(), &[1, 1]);
    }
}
