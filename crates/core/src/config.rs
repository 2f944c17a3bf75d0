use serde::Deserialize;

fn default_architectures() -> Vec<String> {
    vec!["LlavaLlamaForCausalLM".to_string()]
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_bos_token_id() -> u32 {
    1
}

fn default_eos_token_id() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// `config.json` of a LLaVA-LLaMA checkpoint.
///
/// The LLaMA fields drive the transformer body. The `mm_*` fields describe the
/// vision side and are all optional: a text-only LLaMA config parses too and
/// simply builds a model without a vision tower.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_architectures")]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default = "default_true")]
    pub use_cache: bool,

    // Multimodal
    #[serde(default, alias = "vision_tower")]
    pub mm_vision_tower: Option<String>,
    #[serde(default)]
    pub mm_hidden_size: Option<usize>,
    #[serde(default)]
    pub mm_projector_type: Option<String>,
    #[serde(default)]
    pub mm_vision_select_layer: Option<i64>,
    #[serde(default)]
    pub mm_vision_select_feature: Option<String>,
    #[serde(default)]
    pub image_aspect_ratio: Option<String>,
    #[serde(default)]
    pub mm_use_im_start_end: bool,
    #[serde(default)]
    pub mm_use_im_patch_token: bool,
    #[serde(default)]
    pub image_token_index: Option<u32>,
    #[serde(default)]
    pub tokenizer_model_max_length: Option<usize>,
    #[serde(default)]
    pub tokenizer_padding_side: Option<String>,
    #[serde(default)]
    pub max_sequence_length: Option<usize>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelConfig {
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Context window advertised to callers.
    pub fn context_len(&self) -> usize {
        self.max_sequence_length.unwrap_or(2048)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: default_architectures(),
            model_type: Some("llava_llama".to_string()),
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            num_hidden_layers: 32,
            intermediate_size: 11008,
            vocab_size: 32000,
            max_position_embeddings: 4096,
            head_dim: None,
            hidden_act: default_hidden_act(),
            rms_norm_eps: 1e-5,
            rope_theta: default_rope_theta(),
            tie_word_embeddings: false,
            bos_token_id: 1,
            eos_token_id: 2,
            use_cache: true,
            mm_vision_tower: Some("openai/clip-vit-large-patch14-336".to_string()),
            mm_hidden_size: Some(1024),
            mm_projector_type: Some("mlp2x_gelu".to_string()),
            mm_vision_select_layer: Some(-2),
            mm_vision_select_feature: Some("patch".to_string()),
            image_aspect_ratio: Some("pad".to_string()),
            mm_use_im_start_end: false,
            mm_use_im_patch_token: false,
            image_token_index: None,
            tokenizer_model_max_length: Some(2048),
            tokenizer_padding_side: Some("right".to_string()),
            max_sequence_length: None,
            extra: serde_json::Map::new(),
        }
    }
}
