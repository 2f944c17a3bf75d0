//! Checkpoint loading: config, tokenizer, image processor and weights.
//!
//! A checkpoint is either a local directory or a Hugging Face Hub repo id.
//! Weights may come as one safetensors file, sharded safetensors with an
//! index, or PyTorch pickles. The CLIP vision tower is a separate checkpoint
//! named by `mm_vision_tower` and lands under `model.vision_tower.`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use hf_hub::api::sync::{Api, ApiError, ApiRepo};
use thiserror::Error;

use crate::config::ModelConfig;
use crate::conversation::model_name_from_path;
use crate::models::transfer::named_vars;
use crate::models::{
    ClipVisionConfig, LlavaConfig, ModelError, ModelRegistry, PretrainedModel,
};
use crate::multimodal::{
    ImageProcessor, ImageProcessorConfig, DEFAULT_IMAGE_PATCH_TOKEN, DEFAULT_IM_END_TOKEN,
    DEFAULT_IM_START_TOKEN,
};
use crate::tokenizer::{TokenizerError, TokenizerWrapper};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("hub request for {repo} failed: {source}")]
    Hub {
        repo: String,
        #[source]
        source: ApiError,
    },
    #[error("{file} not found in {location}")]
    MissingFile { location: String, file: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{source} (pass --tokenizer to point at a tokenizer.json)")]
    Tokenizer {
        #[source]
        source: TokenizerError,
    },
    #[error("no weight files found in {0}")]
    NoWeights(String),
    #[error("failed to load weights from {}: {source}", path.display())]
    Weights {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },
    #[error("checkpoint tensor {name} has shape {found:?}, model expects {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

// ─── Checkpoint location ─────────────────────────────────────────────────────

/// Where a checkpoint's files come from.
pub enum CheckpointDir {
    Local(PathBuf),
    Hub { id: String, repo: ApiRepo },
}

impl CheckpointDir {
    /// An existing directory is used in place; anything else is a hub id.
    pub fn resolve(path: &str) -> Result<Self, LoadError> {
        let local = Path::new(path);
        if local.is_dir() {
            return Ok(Self::Local(local.to_path_buf()));
        }
        let api = Api::new().map_err(|source| LoadError::Hub {
            repo: path.to_string(),
            source,
        })?;
        Ok(Self::Hub {
            id: path.to_string(),
            repo: api.model(path.to_string()),
        })
    }

    pub fn location(&self) -> String {
        match self {
            Self::Local(dir) => dir.display().to_string(),
            Self::Hub { id, .. } => id.clone(),
        }
    }

    /// Local path of `file`, downloading it when needed.
    pub fn get(&self, file: &str) -> Result<PathBuf, LoadError> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(LoadError::MissingFile {
                        location: self.location(),
                        file: file.to_string(),
                    })
                }
            }
            Self::Hub { id, repo } => repo.get(file).map_err(|source| LoadError::Hub {
                repo: id.clone(),
                source,
            }),
        }
    }

    /// Like [`Self::get`], for files a checkpoint may legitimately lack.
    pub fn try_get(&self, file: &str) -> Option<PathBuf> {
        match self.get(file) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(file, error = %e, "optional checkpoint file unavailable");
                None
            }
        }
    }

    /// Weight files in shard order.
    pub fn weight_files(&self) -> Result<Vec<PathBuf>, LoadError> {
        for single in ["model.safetensors", "pytorch_model.bin"] {
            if let Some(path) = self.try_get(single) {
                return Ok(vec![path]);
            }
        }
        for index in ["model.safetensors.index.json", "pytorch_model.bin.index.json"] {
            if let Some(index_path) = self.try_get(index) {
                return shard_names(&index_path)?
                    .iter()
                    .map(|name| self.get(name))
                    .collect();
            }
        }
        Err(LoadError::NoWeights(self.location()))
    }
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&first) = chars.peek() {
        let numeric = first.is_ascii_digit();
        let mut segment = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() == numeric) {
            segment.push(c);
        }
        if numeric {
            parts.push(Ok(segment.parse::<u64>().unwrap_or(0)));
        } else {
            parts.push(Err(segment));
        }
    }
    parts
}

/// Distinct shard file names listed in an index's `weight_map`.
fn shard_names(index_path: &Path) -> Result<Vec<String>, LoadError> {
    let index: serde_json::Value = read_json(index_path)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| LoadError::NoWeights(index_path.display().to_string()))?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();
    Ok(filenames)
}

// ─── Weights ─────────────────────────────────────────────────────────────────

fn read_tensors(path: &Path) -> Result<Vec<(String, Tensor)>, LoadError> {
    let weights_err = |source| LoadError::Weights {
        path: path.to_path_buf(),
        source,
    };
    let is_safetensors = path.extension().is_some_and(|ext| ext == "safetensors");
    if is_safetensors {
        let tensors: HashMap<String, Tensor> =
            candle_core::safetensors::load(path, &Device::Cpu).map_err(weights_err)?;
        Ok(tensors.into_iter().collect())
    } else {
        candle_core::pickle::read_all(path).map_err(weights_err)
    }
}

/// Checkpoint names of the CLIP wrapper carry an extra `vision_tower.` level.
fn canonical_name(name: &str) -> String {
    match name.strip_prefix("model.vision_tower.vision_tower.") {
        Some(rest) => format!("model.vision_tower.{rest}"),
        None => name.to_string(),
    }
}

/// Names touched by a sequence of weight loads.
#[derive(Debug, Default, Clone)]
pub struct WeightLoadReport {
    pub loaded: BTreeSet<String>,
    /// Checkpoint tensors the model has no parameter for.
    pub unexpected: Vec<String>,
}

impl WeightLoadReport {
    /// Model parameters no load reached.
    pub fn missing(&self, params: &VarMap) -> Vec<String> {
        named_vars(params)
            .into_keys()
            .filter(|name| !self.loaded.contains(name))
            .collect()
    }
}

fn set_var(name: &str, var: &Var, tensor: &Tensor) -> Result<(), LoadError> {
    if var.dims() != tensor.dims() {
        return Err(LoadError::WeightShape {
            name: name.to_string(),
            expected: var.dims().to_vec(),
            found: tensor.dims().to_vec(),
        });
    }
    let value = tensor
        .to_device(var.device())
        .and_then(|t| t.to_dtype(var.dtype()))
        .map_err(ModelError::from)?;
    var.set(&value).map_err(ModelError::from)?;
    Ok(())
}

/// Copy every tensor of `files` into `params`, prefixing names with `prefix`.
/// Later loads overwrite earlier ones.
pub fn load_weights_into(
    params: &VarMap,
    files: &[PathBuf],
    prefix: &str,
    report: &mut WeightLoadReport,
) -> Result<(), LoadError> {
    let vars = named_vars(params);
    for file in files {
        tracing::debug!(file = %file.display(), prefix, "loading weights");
        for (raw, tensor) in read_tensors(file)? {
            let name = canonical_name(&format!("{prefix}{raw}"));
            match vars.get(&name) {
                Some(var) => {
                    set_var(&name, var, &tensor)?;
                    report.loaded.insert(name);
                }
                None => report.unexpected.push(name),
            }
        }
    }
    Ok(())
}

// ─── Pretrained model ────────────────────────────────────────────────────────

pub struct LoadRequest<'a> {
    /// Local directory or hub id.
    pub model_path: &'a str,
    /// Full base checkpoint for projector-only fine-tunes.
    pub model_base: Option<&'a str>,
    /// Overrides the checkpoint's `tokenizer.json`.
    pub tokenizer_path: Option<&'a Path>,
    pub device: &'a Device,
    pub dtype: DType,
}

impl<'a> LoadRequest<'a> {
    pub fn new(model_path: &'a str, device: &'a Device, dtype: DType) -> Self {
        Self {
            model_path,
            model_base: None,
            tokenizer_path: None,
            device,
            dtype,
        }
    }
}

pub struct LoadedModel {
    pub model_name: String,
    pub tokenizer: TokenizerWrapper,
    pub model: PretrainedModel,
    pub image_processor: ImageProcessor,
    pub context_len: usize,
    pub weights: WeightLoadReport,
}

struct VisionTowerFiles {
    dir: CheckpointDir,
    config: ClipVisionConfig,
    processor: ImageProcessorConfig,
}

fn resolve_vision_tower(name: &str) -> Result<VisionTowerFiles, LoadError> {
    let dir = CheckpointDir::resolve(name)?;
    let config_json: serde_json::Value = read_json(&dir.get("config.json")?)?;
    let processor = match dir.try_get("preprocessor_config.json") {
        Some(path) => read_json(&path)?,
        None => {
            tracing::warn!(tower = name, "no preprocessor_config.json, using CLIP-336 defaults");
            ImageProcessorConfig::default()
        }
    };
    Ok(VisionTowerFiles {
        config: ClipVisionConfig::from_json(&config_json),
        dir,
        processor,
    })
}

fn load_tokenizer(
    request: &LoadRequest,
    checkpoint: &CheckpointDir,
    base: Option<&CheckpointDir>,
) -> Result<TokenizerWrapper, LoadError> {
    let path = match (request.tokenizer_path, base) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(base)) => base
            .try_get("tokenizer.json")
            .map_or_else(|| checkpoint.get("tokenizer.json"), Ok)?,
        (None, None) => checkpoint.get("tokenizer.json")?,
    };
    TokenizerWrapper::from_file(&path).map_err(|source| LoadError::Tokenizer { source })
}

/// Load everything needed to score with the checkpoint at `request.model_path`.
pub fn load_pretrained_model(
    request: &LoadRequest,
    registry: &ModelRegistry,
) -> Result<LoadedModel, LoadError> {
    let model_name = model_name_from_path(request.model_path);
    tracing::info!(model = request.model_path, name = %model_name, "loading checkpoint");

    let checkpoint = CheckpointDir::resolve(request.model_path)?;
    let base = request
        .model_base
        .map(CheckpointDir::resolve)
        .transpose()?;

    let config: ModelConfig = read_json(&checkpoint.get("config.json")?)?;
    let tower = config
        .mm_vision_tower
        .as_deref()
        .map(resolve_vision_tower)
        .transpose()?;
    let llava_config = LlavaConfig::new(config, tower.as_ref().map(|t| t.config.clone()))?;
    let model = registry.build(&llava_config, request.device, request.dtype)?;

    let mut tokenizer = load_tokenizer(request, &checkpoint, base.as_ref())?;
    if llava_config.use_im_patch_token {
        tokenizer.add_special_tokens(&[DEFAULT_IMAGE_PATCH_TOKEN]);
    }
    if llava_config.use_im_start_end {
        tokenizer.add_special_tokens(&[DEFAULT_IM_START_TOKEN, DEFAULT_IM_END_TOKEN]);
    }
    let tokenizer = tokenizer.with_bos(Some(llava_config.model.bos_token_id));

    let mut weights = WeightLoadReport::default();
    if let Some(tower) = &tower {
        let files = tower.dir.weight_files()?;
        load_weights_into(model.params(), &files, "model.vision_tower.", &mut weights)?;
    }
    if let Some(base) = &base {
        tracing::info!(base = %base.location(), "loading base weights");
        load_weights_into(model.params(), &base.weight_files()?, "", &mut weights)?;
    }
    load_weights_into(model.params(), &checkpoint.weight_files()?, "", &mut weights)?;

    let missing = weights.missing(model.params());
    tracing::info!(
        loaded = weights.loaded.len(),
        unexpected = weights.unexpected.len(),
        missing = missing.len(),
        "weights loaded"
    );
    if !missing.is_empty() {
        tracing::warn!(names = ?missing, "parameters absent from checkpoint keep their initialization");
    }
    if !weights.unexpected.is_empty() {
        tracing::debug!(names = ?weights.unexpected, "checkpoint tensors without a parameter");
    }

    let image_processor = ImageProcessor::new(
        tower
            .map(|t| t.processor)
            .unwrap_or_default(),
    );
    let context_len = llava_config.model.context_len();

    Ok(LoadedModel {
        model_name,
        tokenizer,
        model,
        image_processor,
        context_len,
        weights,
    })
}
