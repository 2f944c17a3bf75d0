use candle_core::{DType, Result, Tensor};

/// Mean over the sequence axis of `[b, s, h]` hidden states.
///
/// With a `[b, s]` mask (nonzero = keep) only kept positions contribute and the
/// sum is divided by the number of kept positions. Masked positions are
/// selected away rather than multiplied by zero, so whatever they contain
/// (including non-finite values) cannot reach the result. Without a mask every
/// position counts equally.
pub fn masked_mean(hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
    let Some(mask) = attention_mask else {
        return hidden_states.mean(1);
    };

    let keep = mask.to_dtype(DType::F32)?.ne(0f32)?;
    let selector = keep.unsqueeze(2)?.broadcast_as(hidden_states.shape())?;
    let zeros = hidden_states.zeros_like()?;
    let summed = selector.where_cond(hidden_states, &zeros)?.sum(1)?;

    let count = keep
        .to_dtype(DType::F32)?
        .sum_keepdim(1)?
        .clamp(1f64, f64::MAX)?
        .to_dtype(hidden_states.dtype())?;
    summed.broadcast_div(&count)
}
