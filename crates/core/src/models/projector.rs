//! Vision-language projector (`model.mm_projector`).
//!
//! Maps CLIP features `[.., H_v]` into the language model's hidden space
//! `[.., H]`. Checkpoints store it as a torch `nn.Sequential`, so linear layers
//! sit at even indices (`mm_projector.0`, `mm_projector.2`, ...) with the GELU
//! modules in between holding no weights.

use std::sync::LazyLock;

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use regex::Regex;

static MLP_GELU_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^mlp(\d+)x_gelu$").expect("MLP_GELU_REGEX pattern is invalid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorType {
    /// Single linear layer (`linear`).
    Linear,
    /// `depth` linear layers with GELU between them (`mlp{depth}x_gelu`).
    MlpGelu { depth: usize },
    /// No projection; vision width must equal the hidden size.
    Identity,
}

impl ProjectorType {
    /// Parse `mm_projector_type`. A missing value means `linear`.
    pub fn parse(s: Option<&str>) -> Option<Self> {
        let Some(s) = s else {
            return Some(Self::Linear);
        };
        match s {
            "linear" => Some(Self::Linear),
            "identity" => Some(Self::Identity),
            other => MLP_GELU_REGEX
                .captures(other)
                .and_then(|c| c[1].parse::<usize>().ok())
                .filter(|&depth| depth >= 1)
                .map(|depth| Self::MlpGelu { depth }),
        }
    }
}

pub struct MultimodalProjector {
    layers: Vec<Linear>,
}

impl MultimodalProjector {
    pub fn new(
        projector_type: ProjectorType,
        vision_hidden_size: usize,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let depth = match projector_type {
            ProjectorType::Identity => {
                if vision_hidden_size != hidden_size {
                    candle_core::bail!(
                        "identity projector needs equal widths, got {vision_hidden_size} and {hidden_size}"
                    );
                }
                0
            }
            ProjectorType::Linear => {
                let layer = linear(vision_hidden_size, hidden_size, vb)?;
                return Ok(Self {
                    layers: vec![layer],
                });
            }
            ProjectorType::MlpGelu { depth } => depth,
        };

        let mut layers = Vec::with_capacity(depth);
        for i in 0..depth {
            let in_dim = if i == 0 { vision_hidden_size } else { hidden_size };
            layers.push(linear(in_dim, hidden_size, vb.pp(2 * i))?);
        }
        Ok(Self { layers })
    }
}

impl Module for MultimodalProjector {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = xs.gelu_erf()?;
            }
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn parse_projector_types() {
        assert_eq!(ProjectorType::parse(None), Some(ProjectorType::Linear));
        assert_eq!(ProjectorType::parse(Some("linear")), Some(ProjectorType::Linear));
        assert_eq!(
            ProjectorType::parse(Some("mlp2x_gelu")),
            Some(ProjectorType::MlpGelu { depth: 2 })
        );
        assert_eq!(
            ProjectorType::parse(Some("mlp12x_gelu")),
            Some(ProjectorType::MlpGelu { depth: 12 })
        );
        assert_eq!(ProjectorType::parse(Some("identity")), Some(ProjectorType::Identity));
        assert_eq!(ProjectorType::parse(Some("mlp0x_gelu")), None);
        assert_eq!(ProjectorType::parse(Some("resampler")), None);
    }

    #[test]
    fn mlp_weights_use_sequential_indices() {
        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, DType::F32, &Device::Cpu);
        let proj = MultimodalProjector::new(
            ProjectorType::MlpGelu { depth: 2 },
            8,
            16,
            vb.pp("model.mm_projector"),
        )
        .unwrap();

        let mut names: Vec<String> = params.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "model.mm_projector.0.bias",
                "model.mm_projector.0.weight",
                "model.mm_projector.2.bias",
                "model.mm_projector.2.weight",
            ]
        );

        let xs = Tensor::ones((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(proj.forward(&xs).unwrap().dims(), &[1, 4, 16]);
    }

    #[test]
    fn linear_projector_has_no_index() {
        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, DType::F32, &Device::Cpu);
        MultimodalProjector::new(ProjectorType::Linear, 8, 16, vb.pp("model.mm_projector"))
            .unwrap();
        assert!(params
            .data()
            .lock()
            .unwrap()
            .contains_key("model.mm_projector.weight"));
    }

    #[test]
    fn identity_requires_matching_widths() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(MultimodalProjector::new(ProjectorType::Identity, 8, 16, vb.clone()).is_err());
        let proj = MultimodalProjector::new(ProjectorType::Identity, 8, 8, vb).unwrap();
        let xs = Tensor::ones((2, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(proj.forward(&xs).unwrap().dims(), &[2, 8]);
    }
}
