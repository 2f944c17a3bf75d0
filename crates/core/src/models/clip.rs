//! CLIP vision tower (`CLIPVisionModel`) used as the LLaVA image encoder.
//!
//! class_embedding + patch_embedding (no bias) + position_embedding →
//! pre_layrnorm (typo preserved) → pre-norm encoder. LLaVA reads an
//! intermediate encoder hidden state rather than the pooled output, so
//! `post_layernorm` is never applied and the encoder stops at the selected
//! layer.
//!
//! Weight paths (relative to the tower prefix):
//! - `vision_model.embeddings.{class_embedding,patch_embedding,position_embedding}.*`
//! - `vision_model.pre_layrnorm.{weight,bias}` (intentional typo)
//! - `vision_model.encoder.layers.{i}.{layer_norm1,layer_norm2,self_attn,mlp}.*`

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, linear, ops::softmax_last_dim, Conv2dConfig,
    Embedding, LayerNorm, Linear, VarBuilder,
};

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipActivation {
    QuickGelu,
    Gelu,
}

#[derive(Debug, Clone)]
pub struct ClipVisionConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: ClipActivation,
}

impl Default for ClipVisionConfig {
    /// CLIP ViT-L/14 @ 336px.
    fn default() -> Self {
        Self {
            hidden_size: 1024,
            num_attention_heads: 16,
            num_hidden_layers: 24,
            intermediate_size: 4096,
            image_size: 336,
            patch_size: 14,
            num_channels: 3,
            layer_norm_eps: 1e-5,
            hidden_act: ClipActivation::QuickGelu,
        }
    }
}

impl ClipVisionConfig {
    /// Parse a CLIP `config.json`. Accepts both the full `CLIPModel` layout
    /// (nested `vision_config`) and a bare `CLIPVisionModel` config.
    pub fn from_json(v: &serde_json::Value) -> Self {
        let v = v.get("vision_config").unwrap_or(v);
        let defaults = Self::default();
        let g = |key, default: usize| {
            v.get(key)
                .and_then(|x| x.as_u64())
                .unwrap_or(default as u64) as usize
        };
        let hidden_act = match v.get("hidden_act").and_then(|x| x.as_str()) {
            Some("gelu") => ClipActivation::Gelu,
            _ => ClipActivation::QuickGelu,
        };
        Self {
            hidden_size: g("hidden_size", defaults.hidden_size),
            num_attention_heads: g("num_attention_heads", defaults.num_attention_heads),
            num_hidden_layers: g("num_hidden_layers", defaults.num_hidden_layers),
            intermediate_size: g("intermediate_size", defaults.intermediate_size),
            image_size: g("image_size", defaults.image_size),
            patch_size: g("patch_size", defaults.patch_size),
            num_channels: g("num_channels", defaults.num_channels),
            layer_norm_eps: v
                .get("layer_norm_eps")
                .and_then(|x| x.as_f64())
                .unwrap_or(defaults.layer_norm_eps),
            hidden_act,
        }
    }

    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches_per_side() * self.num_patches_per_side()
    }

    /// Patches plus the CLS position.
    pub fn num_positions(&self) -> usize {
        self.num_patches() + 1
    }
}

/// Which encoder positions LLaVA keeps (`mm_vision_select_feature`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisionSelectFeature {
    /// Patch positions only; the CLS token is dropped.
    #[default]
    Patch,
    /// CLS token followed by the patches.
    ClsPatch,
}

impl VisionSelectFeature {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "patch" => Some(Self::Patch),
            "cls_patch" => Some(Self::ClsPatch),
            _ => None,
        }
    }

    pub fn num_tokens(&self, cfg: &ClipVisionConfig) -> usize {
        match self {
            Self::Patch => cfg.num_patches(),
            Self::ClsPatch => cfg.num_positions(),
        }
    }
}

// ─── Encoder blocks ──────────────────────────────────────────────────────────

struct ClipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl ClipAttention {
    fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden_size / num_heads;
        Ok(Self {
            q_proj: linear(hidden_size, hidden_size, vb.pp("q_proj"))?,
            k_proj: linear(hidden_size, hidden_size, vb.pp("k_proj"))?,
            v_proj: linear(hidden_size, hidden_size, vb.pp("v_proj"))?,
            out_proj: linear(hidden_size, hidden_size, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, x: Tensor, b: usize, s: usize) -> Result<Tensor> {
        x.reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Bidirectional attention, `[B, S, D]` → `[B, S, D]`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        let q = self.split_heads(self.q_proj.forward(x)?, b, s)?;
        let k = self.split_heads(self.k_proj.forward(x)?, b, s)?;
        let v = self.split_heads(self.v_proj.forward(x)?, b, s)?;

        let attn = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let attn = softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }
}

/// x * sigmoid(1.702 * x)
fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    x.mul(&candle_nn::ops::sigmoid(&(x * 1.702)?)?)
}

struct ClipMlp {
    fc1: Linear,
    fc2: Linear,
    act: ClipActivation,
}

impl ClipMlp {
    fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?;
        let x = match self.act {
            ClipActivation::QuickGelu => quick_gelu(&x)?,
            ClipActivation::Gelu => x.gelu_erf()?,
        };
        self.fc2.forward(&x)
    }
}

struct ClipEncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: ClipAttention,
    layer_norm2: LayerNorm,
    mlp: ClipMlp,
}

impl ClipEncoderLayer {
    fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: ClipAttention::new(
                cfg.hidden_size,
                cfg.num_attention_heads,
                vb.pp("self_attn"),
            )?,
            layer_norm2: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm2"))?,
            mlp: ClipMlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let x = self.self_attn.forward(&self.layer_norm1.forward(x)?)?;
        let x = (residual + x)?;
        let residual = &x;
        let x = self.mlp.forward(&self.layer_norm2.forward(&x)?)?;
        residual + x
    }
}

// ─── Embeddings ──────────────────────────────────────────────────────────────

struct ClipVisionEmbeddings {
    class_embedding: Tensor,            // [H_v]
    patch_embedding: candle_nn::Conv2d, // no bias
    position_embedding: Embedding,
    num_positions: usize,
    device: Device,
}

impl ClipVisionEmbeddings {
    fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let class_embedding = vb.get(cfg.hidden_size, "class_embedding")?;
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let patch_embedding = conv2d_no_bias(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embedding"),
        )?;
        let position_embedding = embedding(
            cfg.num_positions(),
            cfg.hidden_size,
            vb.pp("position_embedding"),
        )?;
        Ok(Self {
            class_embedding,
            patch_embedding,
            position_embedding,
            num_positions: cfg.num_positions(),
            device: vb.device().clone(),
        })
    }

    /// `pixel_values`: `[B, C, H, W]` → `[B, N+1, H_v]`.
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let b = pixel_values.dim(0)?;
        let h_v = self.class_embedding.dim(0)?;

        let patches = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten(2, 3)?
            .transpose(1, 2)?
            .contiguous()?;
        let cls = self
            .class_embedding
            .reshape((1, 1, h_v))?
            .broadcast_as((b, 1, h_v))?
            .contiguous()?;
        let embeddings = Tensor::cat(&[&cls, &patches], 1)?;

        let seq = embeddings.dim(1)?;
        if seq != self.num_positions {
            candle_core::bail!(
                "image yields {seq} positions, vision tower expects {}",
                self.num_positions
            );
        }
        let pos_ids = Tensor::arange(0u32, seq as u32, &self.device)?;
        embeddings.broadcast_add(&self.position_embedding.forward(&pos_ids)?)
    }
}

// ─── Tower ───────────────────────────────────────────────────────────────────

/// CLIP image encoder with LLaVA's layer/feature selection applied.
///
/// Built under the `model.vision_tower` prefix; the tower's own checkpoint
/// names sit below it as `vision_model.*`.
pub struct ClipVisionTower {
    name: String,
    config: ClipVisionConfig,
    embeddings: ClipVisionEmbeddings,
    pre_layrnorm: LayerNorm,
    layers: Vec<ClipEncoderLayer>,
    select_layer: usize,
    select_feature: VisionSelectFeature,
    device: Device,
    dtype: DType,
}

impl ClipVisionTower {
    pub fn new(
        name: &str,
        cfg: &ClipVisionConfig,
        select_layer: i64,
        select_feature: VisionSelectFeature,
        vb: VarBuilder,
    ) -> Result<Self> {
        // hidden-state list = embedding output + one entry per layer
        let num_states = cfg.num_hidden_layers as i64 + 1;
        let resolved = if select_layer < 0 {
            num_states + select_layer
        } else {
            select_layer
        };
        if !(0..num_states).contains(&resolved) {
            candle_core::bail!(
                "mm_vision_select_layer {select_layer} out of range for {} encoder layers",
                cfg.num_hidden_layers
            );
        }

        let vb_v = vb.pp("vision_model");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| ClipEncoderLayer::new(cfg, vb_v.pp("encoder").pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            config: cfg.clone(),
            embeddings: ClipVisionEmbeddings::new(cfg, vb_v.pp("embeddings"))?,
            pre_layrnorm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb_v.pp("pre_layrnorm"))?,
            layers,
            select_layer: resolved as usize,
            select_feature,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// `[N, C, H, W]` pixels → `[N, T, H_v]` selected features.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let pixel_values = pixel_values.to_device(&self.device)?.to_dtype(self.dtype)?;
        let x = self.embeddings.forward(&pixel_values)?;
        let mut x = self.pre_layrnorm.forward(&x)?;
        for layer in &self.layers[..self.select_layer] {
            x = layer.forward(&x)?;
        }
        match self.select_feature {
            VisionSelectFeature::Patch => {
                let seq = x.dim(1)?;
                x.narrow(1, 1, seq - 1)
            }
            VisionSelectFeature::ClsPatch => Ok(x),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClipVisionConfig {
        &self.config
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Feature rows produced per image.
    pub fn num_tokens(&self) -> usize {
        self.select_feature.num_tokens(&self.config)
    }
}
