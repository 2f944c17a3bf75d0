use candle_core::{DType, Result, Tensor};

/// Repeat KV heads for Grouped Query Attention.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

/// Eager scaled dot-product attention over a whole sequence.
///
/// Expects Q, K, V already projected and reshaped to `[b, heads, seq, head_dim]`,
/// K and V with `num_kv_heads` heads. `bias` is added to the scores before the
/// softmax (see [`super::mask::attention_bias`]).
///
/// Returns the attention output `[b, seq, num_heads * head_dim]` and the
/// softmax weights `[b, num_heads, seq, seq]`.
pub fn full_attention(
    q: &Tensor,
    k: Tensor,
    v: Tensor,
    bias: Option<&Tensor>,
    num_kv_groups: usize,
) -> Result<(Tensor, Tensor)> {
    let (b_sz, num_heads, q_len, head_dim) = q.dims4()?;
    let k = repeat_kv(k, num_kv_groups)?.contiguous()?;
    let v = repeat_kv(v, num_kv_groups)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
    let scores = match bias {
        Some(bias) => scores.broadcast_add(bias)?,
        None => scores,
    };
    // softmax in f32, as half-precision checkpoints overflow otherwise
    let weights = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
        .to_dtype(q.dtype())?;
    let output = weights
        .matmul(&v)?
        .transpose(1, 2)?
        .reshape((b_sz, q_len, num_heads * head_dim))?;
    Ok((output, weights))
}
