//! Writes a complete tiny LLaVA checkpoint to disk: model directory, CLIP
//! tower directory and a sample image.

use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use image::{Rgb, RgbImage};

use super::tiny_config::{
    tiny_clip_config, tiny_llava_config, TINY_BASE_VOCAB, TINY_WORDS,
};
use crate::models::transfer::named_vars;
use crate::models::{ClipVisionTower, LlavaForCausalLM, VisionSelectFeature};
use crate::tokenizer::TokenizerWrapper;

pub struct TinyCheckpoint {
    pub model_dir: PathBuf,
    pub tower_dir: PathBuf,
    /// 12x10 RGB gradient PNG.
    pub image_path: PathBuf,
}

fn write_tower(dir: &Path) -> Result<(), Box<dyn Error>> {
    std::fs::create_dir_all(dir)?;
    let clip = tiny_clip_config();
    let config = serde_json::json!({
        "model_type": "clip",
        "vision_config": {
            "hidden_size": clip.hidden_size,
            "num_attention_heads": clip.num_attention_heads,
            "num_hidden_layers": clip.num_hidden_layers,
            "intermediate_size": clip.intermediate_size,
            "image_size": clip.image_size,
            "patch_size": clip.patch_size,
            "num_channels": clip.num_channels,
            "layer_norm_eps": clip.layer_norm_eps,
            "hidden_act": "quick_gelu",
        },
    });
    std::fs::write(dir.join("config.json"), config.to_string())?;
    let preprocessor = serde_json::json!({
        "size": {"shortest_edge": clip.image_size},
        "crop_size": {"height": clip.image_size, "width": clip.image_size},
    });
    std::fs::write(dir.join("preprocessor_config.json"), preprocessor.to_string())?;

    let params = VarMap::new();
    let vb = VarBuilder::from_varmap(&params, DType::F32, &Device::Cpu);
    ClipVisionTower::new("tiny-clip", &clip, -1, VisionSelectFeature::Patch, vb)?;
    params.save(dir.join("model.safetensors"))?;
    Ok(())
}

fn write_model(dir: &Path, tower_dir: &Path) -> Result<(), Box<dyn Error>> {
    std::fs::create_dir_all(dir)?;
    let cfg = tiny_llava_config();
    let m = &cfg.model;
    let config = serde_json::json!({
        "architectures": m.architectures,
        "model_type": m.model_type,
        "hidden_size": m.hidden_size,
        "num_attention_heads": m.num_attention_heads,
        "num_key_value_heads": m.num_key_value_heads,
        "num_hidden_layers": m.num_hidden_layers,
        "intermediate_size": m.intermediate_size,
        "vocab_size": m.vocab_size,
        "max_position_embeddings": m.max_position_embeddings,
        "rms_norm_eps": m.rms_norm_eps,
        "hidden_act": m.hidden_act,
        "mm_vision_tower": tower_dir.to_string_lossy(),
        "mm_hidden_size": m.mm_hidden_size,
        "mm_projector_type": m.mm_projector_type,
        "mm_vision_select_layer": m.mm_vision_select_layer,
        "mm_vision_select_feature": m.mm_vision_select_feature,
        "tokenizer_padding_side": "right",
        "use_cache": true,
    });
    std::fs::write(dir.join("config.json"), config.to_string())?;

    // released LLaVA checkpoints leave the CLIP weights to the tower repo
    let model = LlavaForCausalLM::new(&cfg, &Device::Cpu, DType::F32)?;
    let tensors: HashMap<String, Tensor> = named_vars(model.params())
        .into_iter()
        .filter(|(name, _)| !name.starts_with("model.vision_tower."))
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;

    TokenizerWrapper::for_testing(TINY_BASE_VOCAB, TINY_WORDS).save(&dir.join("tokenizer.json"))?;
    Ok(())
}

fn write_image(path: &Path) -> Result<(), Box<dyn Error>> {
    let img = RgbImage::from_fn(12, 10, |x, y| Rgb([(x * 20) as u8, (y * 25) as u8, 128]));
    img.save(path)?;
    Ok(())
}

/// Lay out `tiny-llava/`, `tiny-clip/` and `image.png` under `root`.
pub fn write_tiny_checkpoint(root: &Path) -> Result<TinyCheckpoint, Box<dyn Error>> {
    let tower_dir = root.join("tiny-clip");
    let model_dir = root.join("tiny-llava");
    let image_path = root.join("image.png");
    write_tower(&tower_dir)?;
    write_model(&model_dir, &tower_dir)?;
    write_image(&image_path)?;
    Ok(TinyCheckpoint {
        model_dir,
        tower_dir,
        image_path,
    })
}
