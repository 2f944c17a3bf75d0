use candle_core::{DType, Device, Result, Tensor};

pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    /// Rotate q/k `[b, heads, seq, head_dim]`.
    ///
    /// Without `position_ids` every row uses positions `0..seq`. With
    /// `position_ids` `[b, seq]` each row gathers its own angles, which is what
    /// fused multimodal sequences with padding need.
    pub fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        position_ids: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (b_sz, _h, seq_len, _d) = q.dims4()?;
        let Some(position_ids) = position_ids else {
            let cos = self.cos.narrow(0, 0, seq_len)?;
            let sin = self.sin.narrow(0, 0, seq_len)?;
            let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
            let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
            return Ok((q, k));
        };

        let mut q_rows = Vec::with_capacity(b_sz);
        let mut k_rows = Vec::with_capacity(b_sz);
        for b in 0..b_sz {
            let positions = position_ids.get(b)?.to_dtype(DType::U32)?;
            let cos = self.cos.index_select(&positions, 0)?;
            let sin = self.sin.index_select(&positions, 0)?;
            let q_b = q.narrow(0, b, 1)?.contiguous()?;
            let k_b = k.narrow(0, b, 1)?.contiguous()?;
            q_rows.push(candle_nn::rotary_emb::rope(&q_b, &cos, &sin)?);
            k_rows.push(candle_nn::rotary_emb::rope(&k_b, &cos, &sin)?);
        }
        Ok((Tensor::cat(&q_rows, 0)?, Tensor::cat(&k_rows, 0)?))
    }
}
