//! Request-scoped input bundle for a reward forward pass.

use candle_core::Tensor;

/// Textual marker replaced by the image feature rows.
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";
pub const DEFAULT_IMAGE_PATCH_TOKEN: &str = "<im_patch>";
pub const DEFAULT_IM_START_TOKEN: &str = "<im_start>";
pub const DEFAULT_IM_END_TOKEN: &str = "<im_end>";

/// Placeholder id for [`DEFAULT_IMAGE_TOKEN`] when the config does not name one.
///
/// Chosen outside any vocabulary (it is `-200` reinterpreted as `u32`), so it can
/// never collide with a real or an added token.
pub const IMAGE_TOKEN_INDEX: u32 = u32::MAX - 199;

/// Everything one forward pass consumes.
///
/// Either `input_ids` or `inputs_embeds` must be set. When `inputs_embeds` is
/// present it is used as is and multimodal fusion is skipped.
#[derive(Debug, Clone, Default)]
pub struct MultimodalInputs {
    /// Token ids `[b, s]` with image placeholder ids embedded.
    pub input_ids: Option<Tensor>,
    /// `[b, s]`, nonzero = attend.
    pub attention_mask: Option<Tensor>,
    /// `[b, s]` explicit positions.
    pub position_ids: Option<Tensor>,
    /// Precomputed `[b, s, hidden]` embeddings.
    pub inputs_embeds: Option<Tensor>,
    /// Preprocessed pixels `[n, 3, h, w]`, consumed in placeholder order.
    pub images: Option<Tensor>,
    /// Original `(width, height)` of each image.
    pub image_sizes: Vec<(u32, u32)>,
}

impl MultimodalInputs {
    pub fn from_ids(input_ids: Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Self::default()
        }
    }

    pub fn from_embeds(inputs_embeds: Tensor) -> Self {
        Self {
            inputs_embeds: Some(inputs_embeds),
            ..Self::default()
        }
    }

    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn with_position_ids(mut self, position_ids: Tensor) -> Self {
        self.position_ids = Some(position_ids);
        self
    }

    pub fn with_images(mut self, images: Tensor, image_sizes: Vec<(u32, u32)>) -> Self {
        self.images = Some(images);
        self.image_sizes = image_sizes;
        self
    }

    pub fn num_images(&self) -> usize {
        self.images
            .as_ref()
            .and_then(|t| t.dim(0).ok())
            .unwrap_or(0)
    }
}
