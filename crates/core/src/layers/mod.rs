pub mod attention;
pub mod mask;
pub mod mlp;
pub mod pooling;
pub mod rotary;

pub use attention::{full_attention, repeat_kv};
pub use mask::{attention_bias, causal_mask};
pub use mlp::{parse_activation, SwiGluMlp};
pub use pooling::masked_mean;
pub use rotary::RotaryEmbedding;
