use candle_core::{Device, Tensor};

use crate::config::ModelConfig;
use crate::models::{ClipVisionConfig, LlavaConfig};

/// Token ids reserved for the test vocabulary (`t0..t47`); the named words
/// follow.
pub const TINY_BASE_VOCAB: usize = 48;
pub const TINY_WORDS: &[&str] = &["What", "is", "in", "this", "image", "?", "USER", "ASSISTANT", ":"];

/// CLIP with 8x8 images cut into four 4x4 patches.
pub fn tiny_clip_config() -> ClipVisionConfig {
    ClipVisionConfig {
        hidden_size: 8,
        num_attention_heads: 2,
        num_hidden_layers: 2,
        intermediate_size: 16,
        image_size: 8,
        patch_size: 4,
        num_channels: 3,
        layer_norm_eps: 1e-5,
        ..ClipVisionConfig::default()
    }
}

/// LLaVA-LLaMA with a 16-wide, 2-layer body (GQA 4:2) and the tiny CLIP tower.
pub fn tiny_llava_model_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["LlavaLlamaForCausalLM".to_string()],
        model_type: Some("llava_llama".to_string()),
        hidden_size: 16,
        num_attention_heads: 4,
        num_key_value_heads: Some(2),
        num_hidden_layers: 2,
        intermediate_size: 32,
        vocab_size: 64,
        max_position_embeddings: 128,
        rms_norm_eps: 1e-6,
        mm_vision_tower: Some("tiny-clip".to_string()),
        mm_hidden_size: Some(8),
        image_aspect_ratio: None,
        tokenizer_model_max_length: None,
        ..ModelConfig::default()
    }
}

pub fn tiny_llava_config() -> LlavaConfig {
    LlavaConfig::new(tiny_llava_model_config(), Some(tiny_clip_config()))
        .expect("tiny llava config is consistent")
}

/// `[1, 5]` ids with one image placeholder in the middle, and one random
/// `[1, 3, 8, 8]` image.
pub fn tiny_prompt_ids(cfg: &LlavaConfig, device: &Device) -> (Tensor, Tensor) {
    let ids = Tensor::new(&[[1u32, 5, cfg.image_token_id, 6, 7]], device)
        .expect("prompt ids");
    let images = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), device).expect("random image");
    (ids, images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProjectorType;

    #[test]
    fn tiny_llava_config_is_valid() {
        let cfg = tiny_llava_config();
        assert_eq!(cfg.model.hidden_size, 16);
        assert_eq!(cfg.model.head_dim(), 4);
        assert_eq!(cfg.model.num_kv_heads(), 2);
        assert!(!cfg.model.tie_word_embeddings);
        assert_eq!(cfg.projector_type, ProjectorType::MlpGelu { depth: 2 });
        let tower = cfg.vision_tower.unwrap();
        assert_eq!(tower.clip.num_patches(), 4);
        assert_eq!(tower.clip.hidden_size, cfg.model.mm_hidden_size.unwrap());
    }

    #[test]
    fn tiny_vocab_fits_in_embedding() {
        assert!(TINY_BASE_VOCAB + TINY_WORDS.len() <= tiny_llava_model_config().vocab_size);
    }
}
