use candle_core::{DType, Device, Result, Tensor};

/// Causal mask for a full (cache-free) pass.
/// Returns shape [1, 1, seq_len, seq_len].
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?;
    mask.to_dtype(dtype)
}

/// Most negative value used for padded key positions.
///
/// Finite so a row whose keys are all padding still softmaxes to a uniform
/// distribution instead of NaN.
fn padding_fill(dtype: DType) -> f32 {
    match dtype {
        DType::F16 => -65504.0,
        _ => -1e9,
    }
}

/// Combine the causal mask with a `[b, s]` padding mask (1 = attend, 0 = pad).
/// Returns shape [b, 1, s, s].
pub fn attention_bias(
    padding_mask: Option<&Tensor>,
    seq_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let causal = causal_mask(seq_len, DType::F32, device)?;
    let bias = match padding_mask {
        None => causal,
        Some(mask) => {
            let (b_sz, mask_len) = mask.dims2()?;
            if mask_len != seq_len {
                candle_core::bail!(
                    "attention mask covers {mask_len} positions, sequence has {seq_len}"
                );
            }
            let keep = mask.to_dtype(DType::F32)?.reshape((b_sz, 1, 1, seq_len))?;
            // 0 where attended, fill where padded
            let pad = ((keep - 1.0)? * (-padding_fill(dtype) as f64))?;
            causal.broadcast_add(&pad)?
        }
    };
    bias.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_is_lower_triangular() {
        let mask = causal_mask(3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert!(rows[1][2].is_infinite());
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn padding_positions_get_large_negative_bias() {
        let mask = Tensor::new(&[[1u32, 1, 0], [1, 1, 1]], &Device::Cpu).unwrap();
        let bias = attention_bias(Some(&mask), 3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(bias.dims(), &[2, 1, 3, 3]);

        let first: Vec<Vec<f32>> = bias.get(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        // last key is padding for every query of the first row
        assert!(first[2][2] <= -1e8);
        assert_eq!(first[2][0], 0.0);

        let second: Vec<Vec<f32>> = bias.get(1).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(second[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn mask_length_mismatch_is_rejected() {
        let mask = Tensor::new(&[[1u32, 1]], &Device::Cpu).unwrap();
        assert!(attention_bias(Some(&mask), 3, DType::F32, &Device::Cpu).is_err());
    }
}
