//! `model_type` → constructor table.
//!
//! Checkpoints announce themselves through `model_type` in `config.json`.
//! Older exports leave it out, so the first `architectures` entry is mapped
//! through a small static catalog as a fallback.

use std::collections::HashMap;

use candle_core::{DType, Device};
use candle_nn::VarMap;

use super::llava::{LlavaConfig, LlavaForCausalLM};
use super::reward::LlavaRewardModel;
use super::transfer::{TransferMode, TransferReport};
use super::ModelError;
use crate::config::ModelConfig;

/// A freshly constructed model, ready to receive checkpoint weights.
pub enum PretrainedModel {
    /// Generation checkpoint; must be converted before scoring.
    CausalLm(LlavaForCausalLM),
    /// Checkpoint that already carries a reward head.
    Reward(LlavaRewardModel),
}

impl PretrainedModel {
    /// The parameter set checkpoint tensors are loaded into.
    pub fn params(&self) -> &VarMap {
        match self {
            Self::CausalLm(m) => m.params(),
            Self::Reward(m) => m.params(),
        }
    }

    pub fn config(&self) -> &LlavaConfig {
        match self {
            Self::CausalLm(m) => m.config(),
            Self::Reward(m) => m.config(),
        }
    }

    /// Turn into a reward model. A reward checkpoint passes through without a
    /// transfer report.
    pub fn into_reward(
        self,
        mode: TransferMode,
    ) -> Result<(LlavaRewardModel, Option<TransferReport>), ModelError> {
        match self {
            Self::CausalLm(lm) => {
                let (reward, report) = LlavaRewardModel::from_pretrained(&lm, mode)?;
                Ok((reward, Some(report)))
            }
            Self::Reward(reward) => Ok((reward, None)),
        }
    }
}

pub type ModelConstructor =
    fn(&LlavaConfig, &Device, DType) -> Result<PretrainedModel, ModelError>;

fn build_causal_lm(
    cfg: &LlavaConfig,
    device: &Device,
    dtype: DType,
) -> Result<PretrainedModel, ModelError> {
    LlavaForCausalLM::new(cfg, device, dtype).map(PretrainedModel::CausalLm)
}

fn build_reward(
    cfg: &LlavaConfig,
    device: &Device,
    dtype: DType,
) -> Result<PretrainedModel, ModelError> {
    LlavaRewardModel::new(cfg, device, dtype).map(PretrainedModel::Reward)
}

// ─── Architecture fallback ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ArchitectureInfo {
    arch_names: &'static [&'static str],
    model_type: &'static str,
}

static ARCHITECTURES: &[ArchitectureInfo] = &[
    ArchitectureInfo {
        arch_names: &["LlavaLlamaForCausalLM"],
        model_type: "llava_llama",
    },
    ArchitectureInfo {
        arch_names: &["LlavaLlamaForReward", "LlavaLlamaRewardModel"],
        model_type: "llava_reward",
    },
];

fn model_type_for_architecture(arch: &str) -> Option<&'static str> {
    ARCHITECTURES
        .iter()
        .find(|info| info.arch_names.contains(&arch))
        .map(|info| info.model_type)
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct ModelRegistry {
    constructors: HashMap<String, ModelConstructor>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The LLaVA model types this crate knows how to build.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("llava", build_causal_lm);
        registry.register("llava_llama", build_causal_lm);
        registry.register("llava_reward", build_reward);
        registry
    }

    pub fn register(&mut self, model_type: &str, constructor: ModelConstructor) {
        self.constructors.insert(model_type.to_string(), constructor);
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.constructors.contains_key(model_type)
    }

    /// The registry key for `cfg`: `model_type` when registered, else the
    /// catalog entry of `architectures[0]`.
    pub fn resolve(&self, cfg: &ModelConfig) -> Result<String, ModelError> {
        if let Some(model_type) = cfg.model_type.as_deref() {
            if self.contains(model_type) {
                return Ok(model_type.to_string());
            }
        }
        if let Some(model_type) = cfg
            .architectures
            .first()
            .and_then(|arch| model_type_for_architecture(arch))
            .filter(|model_type| self.contains(model_type))
        {
            return Ok(model_type.to_string());
        }
        let announced = cfg
            .model_type
            .clone()
            .or_else(|| cfg.architectures.first().cloned())
            .unwrap_or_else(|| "<none>".to_string());
        Err(ModelError::UnsupportedModelType(announced))
    }

    pub fn build(
        &self,
        cfg: &LlavaConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<PretrainedModel, ModelError> {
        let key = self.resolve(&cfg.model)?;
        let constructor = self
            .constructors
            .get(&key)
            .ok_or_else(|| ModelError::UnsupportedModelType(key.clone()))?;
        tracing::debug!(model_type = %key, "constructing model");
        constructor(cfg, device, dtype)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_llava_config;

    fn config_with(model_type: Option<&str>, arch: &str) -> ModelConfig {
        let mut cfg = tiny_llava_config().model;
        cfg.model_type = model_type.map(str::to_string);
        cfg.architectures = vec![arch.to_string()];
        cfg
    }

    #[test]
    fn builtin_covers_llava_types() {
        let registry = ModelRegistry::builtin();
        for model_type in ["llava", "llava_llama", "llava_reward"] {
            assert!(registry.contains(model_type), "{model_type} missing");
        }
    }

    #[test]
    fn model_type_wins_over_architecture() {
        let registry = ModelRegistry::builtin();
        let cfg = config_with(Some("llava_reward"), "LlavaLlamaForCausalLM");
        assert_eq!(registry.resolve(&cfg).unwrap(), "llava_reward");
    }

    #[test]
    fn architecture_fallback() {
        let registry = ModelRegistry::builtin();
        let cfg = config_with(None, "LlavaLlamaForCausalLM");
        assert_eq!(registry.resolve(&cfg).unwrap(), "llava_llama");
        let cfg = config_with(Some("something_else"), "LlavaLlamaForReward");
        assert_eq!(registry.resolve(&cfg).unwrap(), "llava_reward");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = ModelRegistry::builtin();
        let cfg = config_with(Some("mistral"), "MistralForCausalLM");
        assert!(matches!(
            registry.resolve(&cfg),
            Err(ModelError::UnsupportedModelType(t)) if t == "mistral"
        ));
    }

    #[test]
    fn empty_registry_rejects_everything() {
        let registry = ModelRegistry::empty();
        let cfg = config_with(Some("llava"), "LlavaLlamaForCausalLM");
        assert!(registry.resolve(&cfg).is_err());
    }

    #[test]
    fn causal_checkpoint_converts_with_report() {
        let mut cfg = tiny_llava_config();
        cfg.model.model_type = Some("llava_llama".into());
        let model = ModelRegistry::builtin()
            .build(&cfg, &Device::Cpu, DType::F32)
            .unwrap();
        assert!(matches!(model, PretrainedModel::CausalLm(_)));
        assert!(model.params().data().lock().unwrap().contains_key("lm_head.weight"));

        let (_, report) = model.into_reward(TransferMode::Strict).unwrap();
        assert!(report.unwrap().skipped.is_empty());
    }

    #[test]
    fn reward_checkpoint_passes_through() {
        let mut cfg = tiny_llava_config();
        cfg.model.model_type = Some("llava_reward".into());
        let model = ModelRegistry::builtin()
            .build(&cfg, &Device::Cpu, DType::F32)
            .unwrap();
        assert!(matches!(model, PretrainedModel::Reward(_)));
        let (reward, report) = model.into_reward(TransferMode::Lenient).unwrap();
        assert!(report.is_none());
        assert!(!reward.config().model.use_cache);
    }
}
