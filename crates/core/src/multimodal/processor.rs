//! CLIP image preprocessing.
//!
//! Pipeline per image:
//! 1. Optionally pad to a square filled with the mean color (`pad` aspect mode)
//! 2. Resize the shortest edge (bicubic)
//! 3. Center crop
//! 4. Rescale to `[0, 1]` and normalize with the channel mean/std
//!
//! Settings come from the vision tower's `preprocessor_config.json`.

use candle_core::{DType, Device, Result, Tensor};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::Deserialize;

/// How images are shaped before the CLIP pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageAspectRatio {
    /// Resize and crop directly.
    #[default]
    Square,
    /// Pad to a square with the mean color first.
    Pad,
    /// Multi-crop high resolution tiling. Not supported; processed as
    /// [`ImageAspectRatio::Square`].
    AnyRes,
}

impl ImageAspectRatio {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("pad") => Self::Pad,
            Some(v) if v.starts_with("anyres") => Self::AnyRes,
            _ => Self::Square,
        }
    }
}

/// `size` / `crop_size` as they appear across processor config versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Edge(u32),
    ShortestEdge { shortest_edge: u32 },
    HeightWidth { height: u32, width: u32 },
}

impl SizeSpec {
    fn shortest_edge(self) -> u32 {
        match self {
            Self::Edge(e) | Self::ShortestEdge { shortest_edge: e } => e,
            Self::HeightWidth { height, width } => height.min(width),
        }
    }

    /// `(height, width)`.
    fn height_width(self) -> (u32, u32) {
        match self {
            Self::Edge(e) | Self::ShortestEdge { shortest_edge: e } => (e, e),
            Self::HeightWidth { height, width } => (height, width),
        }
    }
}

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

fn default_size() -> SizeSpec {
    SizeSpec::ShortestEdge { shortest_edge: 336 }
}

fn default_crop_size() -> SizeSpec {
    SizeSpec::HeightWidth {
        height: 336,
        width: 336,
    }
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_mean() -> [f32; 3] {
    CLIP_MEAN
}

fn default_std() -> [f32; 3] {
    CLIP_STD
}

/// Contents of `preprocessor_config.json` for a CLIP image processor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageProcessorConfig {
    #[serde(default = "default_size")]
    pub size: SizeSpec,
    #[serde(default = "default_crop_size")]
    pub crop_size: SizeSpec,
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_true")]
    pub do_center_crop: bool,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_std")]
    pub image_std: [f32; 3],
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self::clip_336()
    }
}

impl ImageProcessorConfig {
    /// `openai/clip-vit-large-patch14-336`.
    pub fn clip_336() -> Self {
        Self::with_resolution(336)
    }

    /// CLIP settings at an arbitrary square resolution.
    pub fn with_resolution(edge: u32) -> Self {
        Self {
            size: SizeSpec::ShortestEdge {
                shortest_edge: edge,
            },
            crop_size: SizeSpec::HeightWidth {
                height: edge,
                width: edge,
            },
            do_resize: true,
            do_center_crop: true,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: CLIP_MEAN,
            image_std: CLIP_STD,
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

pub struct ImageProcessor {
    config: ImageProcessorConfig,
}

impl ImageProcessor {
    pub fn new(config: ImageProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImageProcessorConfig {
        &self.config
    }

    /// Mean color as 8-bit RGB (truncated).
    fn background(&self) -> Rgb<u8> {
        let [r, g, b] = self.config.image_mean.map(|m| (m * 255.0) as u8);
        Rgb([r, g, b])
    }

    /// Pixel tensors `[n, 3, h, w]` on `device` in `dtype`.
    pub fn process_images(
        &self,
        images: &[RgbImage],
        aspect: ImageAspectRatio,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        if aspect == ImageAspectRatio::AnyRes {
            tracing::warn!("anyres image_aspect_ratio is not supported, processing images as square");
        }
        let tensors = images
            .iter()
            .map(|img| match aspect {
                ImageAspectRatio::Pad => self.preprocess(&expand2square(img, self.background())),
                ImageAspectRatio::Square | ImageAspectRatio::AnyRes => self.preprocess(img),
            })
            .collect::<Result<Vec<_>>>()?;
        let batch = Tensor::stack(&tensors, 0)?;
        tracing::debug!(shape = ?batch.dims(), "preprocessed images");
        batch.to_device(device)?.to_dtype(dtype)
    }

    /// One image → `[3, h, w]` f32 on the CPU.
    pub fn preprocess(&self, img: &RgbImage) -> Result<Tensor> {
        let cfg = &self.config;
        let mut img = img.clone();
        if cfg.do_resize {
            img = resize_shortest_edge(&img, cfg.size.shortest_edge());
        }
        if cfg.do_center_crop {
            let (h, w) = cfg.crop_size.height_width();
            img = center_crop(&img, w, h);
        }

        let (w, h) = img.dimensions();
        let plane = (w * h) as usize;
        let mut data = vec![0f32; 3 * plane];
        for (i, px) in img.pixels().enumerate() {
            for c in 0..3 {
                let mut v = px[c] as f32;
                if cfg.do_rescale {
                    v *= cfg.rescale_factor;
                }
                if cfg.do_normalize {
                    v = (v - cfg.image_mean[c]) / cfg.image_std[c];
                }
                data[c * plane + i] = v;
            }
        }
        Tensor::from_vec(data, (3, h as usize, w as usize), &Device::Cpu)
    }
}

/// Scale so the shorter side equals `edge`; the longer side is truncated.
fn resize_shortest_edge(img: &RgbImage, edge: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let (new_w, new_h) = if w <= h {
        (edge, (edge as u64 * h as u64 / w.max(1) as u64) as u32)
    } else {
        ((edge as u64 * w as u64 / h.max(1) as u64) as u32, edge)
    };
    if (new_w, new_h) == (w, h) {
        return img.clone();
    }
    imageops::resize(img, new_w, new_h, FilterType::CatmullRom)
}

/// Crop `width x height` from the center, zero-padding when the image is
/// smaller.
fn center_crop(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    if (w, h) == (width, height) {
        return img.clone();
    }
    let left = (w as i64 - width as i64).div_euclid(2);
    let top = (h as i64 - height as i64).div_euclid(2);
    let mut out = RgbImage::new(width, height);
    imageops::overlay(&mut out, img, -left, -top);
    out
}

/// Pad the shorter side symmetrically with `background`.
pub fn expand2square(img: &RgbImage, background: Rgb<u8>) -> RgbImage {
    let (w, h) = img.dimensions();
    if w == h {
        return img.clone();
    }
    let side = w.max(h);
    let mut out = RgbImage::from_pixel(side, side, background);
    let x = (side - w) / 2;
    let y = (side - h) / 2;
    imageops::overlay(&mut out, img, x as i64, y as i64);
    out
}
