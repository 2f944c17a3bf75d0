//! Image side of the LLaVA input path.
//!
//! 1. Acquire and decode the image ([`load_image`])
//! 2. Preprocess it into pixel tensors ([`ImageProcessor`])
//! 3. Bundle pixels with token ids ([`MultimodalInputs`])
//! 4. Splice projected image features into the embedding sequence
//!    ([`fuse_multimodal`])

mod fusion;
mod image;
mod inputs;
mod processor;

pub use self::image::{load_image, ImageAcquisitionError, ImageSource};
pub use fusion::{fuse_multimodal, FusedInputs, FusionConfig, PaddingSide};
pub use inputs::{
    MultimodalInputs, DEFAULT_IMAGE_PATCH_TOKEN, DEFAULT_IMAGE_TOKEN, DEFAULT_IM_END_TOKEN,
    DEFAULT_IM_START_TOKEN, IMAGE_TOKEN_INDEX,
};
pub use processor::{
    expand2square, ImageAspectRatio, ImageProcessor, ImageProcessorConfig, SizeSpec, CLIP_MEAN,
    CLIP_STD,
};
