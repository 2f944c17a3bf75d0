use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use crate::config::ModelConfig;
use crate::layers::{attention_bias, full_attention, parse_activation, RotaryEmbedding, SwiGluMlp};

// ─── Attention ───────────────────────────────────────────────────────────────

struct LlamaAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl LlamaAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        let head_dim = cfg.head_dim();

        let q_proj = linear_no_bias(cfg.hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        bias: &Tensor,
        position_ids: Option<&Tensor>,
        rotary_emb: &RotaryEmbedding,
    ) -> Result<(Tensor, Tensor)> {
        let (b_sz, q_len, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary_emb.apply(&q, &k, position_ids)?;
        let (attn_output, weights) = full_attention(
            &q,
            k,
            v,
            Some(bias),
            self.num_heads / self.num_kv_heads,
        )?;

        Ok((attn_output.apply(&self.o_proj)?, weights))
    }
}

// ─── Decoder Layer ───────────────────────────────────────────────────────────

struct LlamaDecoderLayer {
    self_attn: LlamaAttention,
    mlp: SwiGluMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl LlamaDecoderLayer {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = LlamaAttention::new(cfg, vb.pp("self_attn"))?;
        let mlp = SwiGluMlp::new(
            cfg.hidden_size,
            cfg.intermediate_size,
            parse_activation(&cfg.hidden_act)?,
            vb.pp("mlp"),
        )?;
        let input_layernorm =
            rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        bias: &Tensor,
        position_ids: Option<&Tensor>,
        rotary_emb: &RotaryEmbedding,
    ) -> Result<(Tensor, Tensor)> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let (xs, weights) = self.self_attn.forward(&xs, bias, position_ids, rotary_emb)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = self
            .post_attention_layernorm
            .forward(&xs)?
            .apply(&self.mlp)?;
        Ok(((residual + xs)?, weights))
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

/// Result of a full pass through the decoder stack.
#[derive(Debug, Clone)]
pub struct BodyOutput {
    /// Final hidden states after the closing RMSNorm, `[b, s, hidden]`.
    pub last_hidden_state: Tensor,
    /// Embedding output followed by every layer's output (the last one normed).
    pub hidden_states: Option<Vec<Tensor>>,
    /// Per-layer attention weights `[b, heads, s, s]`.
    pub attentions: Option<Vec<Tensor>>,
}

/// The LLaMA decoder stack without a generation head (`model.*` weights).
///
/// Every call processes the full sequence; there is no key/value cache.
pub struct LlamaModel {
    embed_tokens: Embedding,
    layers: Vec<LlamaDecoderLayer>,
    norm: RmsNorm,
    rotary_emb: RotaryEmbedding,
    hidden_size: usize,
    device: Device,
    dtype: DType,
}

impl LlamaModel {
    /// `vb` points at the `model` prefix.
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        let vb_l = vb.pp("layers");
        for i in 0..cfg.num_hidden_layers {
            layers.push(LlamaDecoderLayer::new(cfg, vb_l.pp(i))?);
        }

        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        let rotary_emb = RotaryEmbedding::new(
            cfg.head_dim(),
            cfg.max_position_embeddings,
            cfg.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary_emb,
            hidden_size: cfg.hidden_size,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Look up token embeddings for `[b, s]` or `[s]` ids.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    pub fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        output_hidden_states: bool,
        output_attentions: bool,
    ) -> Result<BodyOutput> {
        let (_b_sz, seq_len, _) = inputs_embeds.dims3()?;
        let bias = attention_bias(attention_mask, seq_len, self.dtype, &self.device)?;

        let mut all_hidden = output_hidden_states.then(Vec::new);
        let mut all_attn = output_attentions.then(Vec::new);

        let mut xs = inputs_embeds.clone();
        for layer in &self.layers {
            if let Some(hidden) = all_hidden.as_mut() {
                hidden.push(xs.clone());
            }
            let (next, weights) = layer.forward(&xs, &bias, position_ids, &self.rotary_emb)?;
            if let Some(attn) = all_attn.as_mut() {
                attn.push(weights);
            }
            xs = next;
        }
        let xs = self.norm.forward(&xs)?;
        if let Some(hidden) = all_hidden.as_mut() {
            hidden.push(xs.clone());
        }

        tracing::debug!(shape = ?xs.dims(), "decoder pass complete");
        Ok(BodyOutput {
            last_hidden_state: xs,
            hidden_states: all_hidden,
            attentions: all_attn,
        })
    }

    pub fn embedding_weight(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
