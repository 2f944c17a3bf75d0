//! Splice image features into the token embedding sequence.
//!
//! Each row of `input_ids` is stripped of padding (when a mask is given), cut
//! at every image placeholder, and rebuilt as
//! `embed(text) ++ image_features[k] ++ embed(text) ++ ...`. Rows are then
//! truncated to the tokenizer's maximum length and padded back to a common
//! length with zero embeddings.

use candle_core::{DType, Device, Tensor};

use crate::models::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingSide {
    #[default]
    Right,
    Left,
}

impl PaddingSide {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("left") => Self::Left,
            _ => Self::Right,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub image_token_id: u32,
    /// `tokenizer_model_max_length`; fused rows longer than this are cut.
    pub max_length: Option<usize>,
    pub padding_side: PaddingSide,
}

/// Fused sequence handed to the transformer body.
#[derive(Debug, Clone)]
pub struct FusedInputs {
    pub inputs_embeds: Tensor,
    /// Present only when the caller supplied a mask.
    pub attention_mask: Option<Tensor>,
    /// Present only when the caller supplied position ids.
    pub position_ids: Option<Tensor>,
}

fn count_placeholders(rows: &[Vec<u32>], image_token_id: u32) -> usize {
    rows.iter()
        .map(|row| row.iter().filter(|&&id| id == image_token_id).count())
        .sum()
}

/// Fuse text and image embeddings.
///
/// `image_features` is `[n_images, tokens_per_image, hidden]`; placeholders
/// consume images in row-major order and their total must equal `n_images`.
/// `embed` maps a `[len]` id tensor to `[len, hidden]` embeddings.
pub fn fuse_multimodal<E>(
    input_ids: &Tensor,
    attention_mask: Option<&Tensor>,
    position_ids: Option<&Tensor>,
    image_features: Option<&Tensor>,
    embed: E,
    cfg: &FusionConfig,
) -> Result<FusedInputs, ModelError>
where
    E: Fn(&Tensor) -> candle_core::Result<Tensor>,
{
    let device = input_ids.device();
    let rows: Vec<Vec<u32>> = input_ids.to_dtype(DType::U32)?.to_vec2()?;
    let keep: Option<Vec<Vec<f32>>> = attention_mask
        .map(|m| m.to_dtype(DType::F32)?.to_vec2())
        .transpose()?;
    let rows: Vec<Vec<u32>> = match &keep {
        Some(keep) => rows
            .iter()
            .zip(keep)
            .map(|(row, keep)| {
                row.iter()
                    .zip(keep)
                    .filter(|(_, k)| **k != 0.0)
                    .map(|(&id, _)| id)
                    .collect()
            })
            .collect(),
        None => rows,
    };
    let placeholders = count_placeholders(&rows, cfg.image_token_id);

    let Some(features) = image_features else {
        if placeholders > 0 {
            return Err(ModelError::ImageCountMismatch {
                placeholders,
                images: 0,
            });
        }
        return Ok(FusedInputs {
            inputs_embeds: embed(input_ids)?,
            attention_mask: attention_mask.cloned(),
            position_ids: position_ids.cloned(),
        });
    };

    let (num_images, _tokens, hidden) = features.dims3()?;
    if placeholders != num_images {
        return Err(ModelError::ImageCountMismatch {
            placeholders,
            images: num_images,
        });
    }

    let mut image_idx = 0;
    let mut fused_rows = Vec::with_capacity(rows.len());
    for ids in &rows {
        let mut pieces = Vec::new();
        for (i, segment) in ids.split(|&id| id == cfg.image_token_id).enumerate() {
            if i > 0 {
                pieces.push(features.get(image_idx)?);
                image_idx += 1;
            }
            if !segment.is_empty() {
                let segment = Tensor::new(segment, device)?;
                pieces.push(embed(&segment)?);
            }
        }
        let mut fused = if pieces.is_empty() {
            Tensor::zeros((0, hidden), features.dtype(), features.device())?
        } else {
            Tensor::cat(&pieces, 0)?
        };
        if let Some(max_length) = cfg.max_length {
            let len = fused.dim(0)?;
            if len > max_length {
                fused = fused.narrow(0, 0, max_length)?;
            }
        }
        fused_rows.push(fused);
    }

    let lengths: Vec<usize> = fused_rows
        .iter()
        .map(|t| t.dim(0))
        .collect::<candle_core::Result<_>>()?;
    let max_len = lengths.iter().copied().max().unwrap_or(0);
    tracing::debug!(?lengths, max_len, num_images, "fused multimodal rows");

    let padded = fused_rows
        .iter()
        .zip(&lengths)
        .map(|(row, &len)| pad_row(row, len, max_len, cfg.padding_side))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let inputs_embeds = Tensor::stack(&padded, 0)?;

    let new_mask = attention_mask
        .map(|_| valid_mask(&lengths, max_len, cfg.padding_side, device))
        .transpose()?;
    let new_positions = position_ids
        .map(|_| valid_positions(&lengths, max_len, cfg.padding_side, device))
        .transpose()?;

    Ok(FusedInputs {
        inputs_embeds,
        attention_mask: new_mask,
        position_ids: new_positions,
    })
}

fn pad_row(
    row: &Tensor,
    len: usize,
    max_len: usize,
    side: PaddingSide,
) -> candle_core::Result<Tensor> {
    if len == max_len {
        return Ok(row.clone());
    }
    let hidden = row.dim(1)?;
    let pad = Tensor::zeros((max_len - len, hidden), row.dtype(), row.device())?;
    match side {
        PaddingSide::Right => Tensor::cat(&[row, &pad], 0),
        PaddingSide::Left => Tensor::cat(&[&pad, row], 0),
    }
}

fn valid_mask(
    lengths: &[usize],
    max_len: usize,
    side: PaddingSide,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let data: Vec<u32> = lengths
        .iter()
        .flat_map(|&len| {
            (0..max_len).map(move |j| {
                let valid = match side {
                    PaddingSide::Right => j < len,
                    PaddingSide::Left => j >= max_len - len,
                };
                u32::from(valid)
            })
        })
        .collect();
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

fn valid_positions(
    lengths: &[usize],
    max_len: usize,
    side: PaddingSide,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let data: Vec<u32> = lengths
        .iter()
        .flat_map(|&len| {
            (0..max_len).map(move |j| match side {
                PaddingSide::Right if j < len => j as u32,
                PaddingSide::Left if j >= max_len - len => (j - (max_len - len)) as u32,
                _ => 0,
            })
        })
        .collect();
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}
