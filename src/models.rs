//! Model artifacts and their fixed tensor contracts

use crate::error::{BgRemovalError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Pascal VOC class index for "person" in `DeepLabV3` label maps
pub const VOC_PERSON_CLASS: usize = 15;

/// Number of Pascal VOC classes including background
pub const VOC_NUM_CLASSES: usize = 21;

/// `DeepLabV3` input resolution
pub const DEEPLAB_INPUT_SIZE: u32 = 513;

/// How the model's first output should be interpreted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputKind {
    /// Already probabilities (softmaxed classes or a sigmoid foreground channel)
    Probabilities,
    /// Raw scores; softmax over channels, or sigmoid for a single channel
    Logits,
    /// One channel of per-pixel class indices (arg-max already applied)
    ClassLabels { num_classes: usize },
}

/// Image preprocessing parameters fixed by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Model input `[width, height]`
    pub target_size: [u32; 2],
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
    /// Preserve aspect ratio and pad symmetrically instead of stretching
    #[serde(default)]
    pub letterbox: bool,
    /// RGB fill for the letterbox padding
    #[serde(default)]
    pub padding_color: [u8; 3],
}

/// The fixed input/output contract of one segmentation network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContract {
    pub name: String,
    /// NCHW
    pub input_shape: (usize, usize, usize, usize),
    /// NCHW
    pub output_shape: (usize, usize, usize, usize),
    pub output_kind: OutputKind,
    /// Classes merged into the foreground; ignored for single-class outputs
    #[serde(default)]
    pub foreground_classes: Vec<usize>,
    pub preprocessing: PreprocessingConfig,
}

impl ModelContract {
    /// `DeepLabV3` (MobileNet) trained on Pascal VOC, person class as foreground
    #[must_use]
    pub fn deeplab_v3() -> Self {
        let size = DEEPLAB_INPUT_SIZE as usize;
        Self {
            name: "deeplabv3".to_string(),
            input_shape: (1, 3, size, size),
            output_shape: (1, VOC_NUM_CLASSES, size, size),
            output_kind: OutputKind::Logits,
            foreground_classes: vec![VOC_PERSON_CLASS],
            preprocessing: PreprocessingConfig {
                target_size: [DEEPLAB_INPUT_SIZE, DEEPLAB_INPUT_SIZE],
                normalization_mean: [0.5, 0.5, 0.5],
                normalization_std: [0.5, 0.5, 0.5],
                letterbox: false,
                padding_color: [0, 0, 0],
            },
        }
    }

    /// Single foreground-probability channel at `size x size`
    #[must_use]
    pub fn binary(name: &str, size: u32) -> Self {
        let side = size as usize;
        Self {
            name: name.to_string(),
            input_shape: (1, 3, side, side),
            output_shape: (1, 1, side, side),
            output_kind: OutputKind::Probabilities,
            foreground_classes: Vec::new(),
            preprocessing: PreprocessingConfig {
                target_size: [size, size],
                normalization_mean: [0.485, 0.456, 0.406],
                normalization_std: [0.229, 0.224, 0.225],
                letterbox: false,
                padding_color: [255, 255, 255],
            },
        }
    }

    #[must_use]
    pub fn with_letterbox(mut self, padding_color: [u8; 3]) -> Self {
        self.preprocessing.letterbox = true;
        self.preprocessing.padding_color = padding_color;
        self
    }

    /// Read a contract from a JSON side-car file
    ///
    /// # Errors
    /// - `ModelLoad` when the file cannot be read, parsed, or fails validation
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BgRemovalError::model_error_with_context(
                "read contract for",
                path,
                &e.to_string(),
                &["check the side-car JSON next to the model file"],
            )
        })?;
        let contract: Self = serde_json::from_str(&content).map_err(|e| {
            BgRemovalError::model_error_with_context("parse contract for", path, &e.to_string(), &[])
        })?;
        contract.validate()?;
        Ok(contract)
    }

    /// Number of classes the network distinguishes
    #[must_use]
    pub fn num_classes(&self) -> usize {
        match self.output_kind {
            OutputKind::ClassLabels { num_classes } => num_classes,
            OutputKind::Probabilities | OutputKind::Logits => self.output_shape.1,
        }
    }

    /// Spatial resolution of the model output `(height, width)`
    #[must_use]
    pub fn output_resolution(&self) -> (usize, usize) {
        (self.output_shape.2, self.output_shape.3)
    }

    /// Check internal consistency of the declared shapes
    ///
    /// # Errors
    /// - `ModelLoad` describing the first inconsistency found
    pub fn validate(&self) -> Result<()> {
        let (n, c, h, w) = self.input_shape;
        if n != 1 || c != 3 || h == 0 || w == 0 {
            return Err(BgRemovalError::model_load(format!(
                "Model '{}' input must be 1x3xHxW, declared {:?}",
                self.name, self.input_shape
            )));
        }
        if [h, w]
            != [
                self.preprocessing.target_size[1] as usize,
                self.preprocessing.target_size[0] as usize,
            ]
        {
            return Err(BgRemovalError::model_load(format!(
                "Model '{}' input {}x{} disagrees with preprocessing target {:?}",
                self.name, w, h, self.preprocessing.target_size
            )));
        }

        let (on, oc, oh, ow) = self.output_shape;
        if on != 1 || oc == 0 || oh == 0 || ow == 0 {
            return Err(BgRemovalError::model_load(format!(
                "Model '{}' output must be 1xCxHxW, declared {:?}",
                self.name, self.output_shape
            )));
        }
        if matches!(self.output_kind, OutputKind::ClassLabels { .. }) && oc != 1 {
            return Err(BgRemovalError::model_load(format!(
                "Model '{}' label output must have one channel, declared {oc}",
                self.name
            )));
        }
        if self.preprocessing.normalization_std.iter().any(|&s| s <= 0.0) {
            return Err(BgRemovalError::model_load(format!(
                "Model '{}' normalization std must be positive",
                self.name
            )));
        }

        let classes = self.num_classes();
        if classes > 1 {
            if self.foreground_classes.is_empty() {
                return Err(BgRemovalError::model_load(format!(
                    "Model '{}' has {classes} classes but no foreground classes",
                    self.name
                )));
            }
            if let Some(bad) = self.foreground_classes.iter().find(|&&c| c >= classes) {
                return Err(BgRemovalError::model_load(format!(
                    "Model '{}' foreground class {bad} out of range 0..{classes}",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

impl Default for ModelContract {
    fn default() -> Self {
        Self::deeplab_v3()
    }
}

/// Model information and metadata
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: usize,
    pub input_shape: (usize, usize, usize, usize),
    pub output_shape: (usize, usize, usize, usize),
}

/// Where the model weights come from
#[derive(Clone)]
pub enum ModelSource {
    /// ONNX file on disk
    External(PathBuf),
    /// ONNX bytes already in memory (e.g. bundled by the host)
    InMemory(Arc<[u8]>),
}

impl std::fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External(path) => f.debug_tuple("External").field(path).finish(),
            Self::InMemory(bytes) => write!(f, "InMemory({} bytes)", bytes.len()),
        }
    }
}

impl ModelSource {
    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::External(path) => format!(
                "external:{}",
                path.file_name().unwrap_or_default().to_string_lossy()
            ),
            Self::InMemory(bytes) => format!("memory:{}b", bytes.len()),
        }
    }
}

/// Model source plus an optional explicit contract
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub source: ModelSource,
    /// When `None`, a `<model>.json` side-car is used if present, else `DeepLabV3`
    pub contract: Option<ModelContract>,
}

impl ModelSpec {
    #[must_use]
    pub fn external<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            source: ModelSource::External(path.into()),
            contract: None,
        }
    }

    #[must_use]
    pub fn in_memory(bytes: Arc<[u8]>, contract: ModelContract) -> Self {
        Self {
            source: ModelSource::InMemory(bytes),
            contract: Some(contract),
        }
    }

    #[must_use]
    pub fn with_contract(mut self, contract: ModelContract) -> Self {
        self.contract = Some(contract);
        self
    }
}

/// Model provider trait for loading models
pub trait ModelProvider: std::fmt::Debug + Send + Sync {
    /// Load model data as bytes
    ///
    /// # Errors
    /// - Model file not found or inaccessible
    fn load_model_data(&self) -> Result<Vec<u8>>;

    /// The tensor contract of this model
    fn contract(&self) -> &ModelContract;

    /// Get the model file path, if there is one
    fn model_path(&self) -> Option<PathBuf>;

    fn display_name(&self) -> String;
}

/// Model file on disk with an optional JSON side-car contract
#[derive(Debug)]
pub struct ExternalModelProvider {
    model_path: PathBuf,
    contract: ModelContract,
}

impl ExternalModelProvider {
    /// Resolve the contract for `model_path`
    ///
    /// Precedence: explicit contract, then `<model>.json`, then `DeepLabV3`.
    ///
    /// # Errors
    /// - `ModelLoad` when a side-car exists but is invalid, or the explicit
    ///   contract fails validation
    pub fn new<P: AsRef<Path>>(model_path: P, contract: Option<ModelContract>) -> Result<Self> {
        let model_path = model_path.as_ref().to_path_buf();
        let contract = match contract {
            Some(contract) => contract,
            None => {
                let side_car = model_path.with_extension("json");
                if side_car.is_file() {
                    log::debug!("Using model contract side-car {}", side_car.display());
                    ModelContract::from_json_file(&side_car)?
                } else {
                    ModelContract::deeplab_v3()
                }
            },
        };
        contract.validate()?;

        Ok(Self {
            model_path,
            contract,
        })
    }
}

impl ModelProvider for ExternalModelProvider {
    fn load_model_data(&self) -> Result<Vec<u8>> {
        fs::read(&self.model_path).map_err(|e| {
            BgRemovalError::model_error_with_context(
                "read",
                &self.model_path,
                &e.to_string(),
                &["check that the model file exists", "verify read permissions"],
            )
        })
    }

    fn contract(&self) -> &ModelContract {
        &self.contract
    }

    fn model_path(&self) -> Option<PathBuf> {
        Some(self.model_path.clone())
    }

    fn display_name(&self) -> String {
        ModelSource::External(self.model_path.clone()).display_name()
    }
}

/// Model bytes supplied by the caller
#[derive(Debug)]
pub struct InMemoryModelProvider {
    bytes: Arc<[u8]>,
    contract: ModelContract,
}

impl InMemoryModelProvider {
    /// # Errors
    /// - `ModelLoad` when the contract fails validation
    pub fn new(bytes: Arc<[u8]>, contract: ModelContract) -> Result<Self> {
        contract.validate()?;
        Ok(Self { bytes, contract })
    }
}

impl ModelProvider for InMemoryModelProvider {
    fn load_model_data(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.to_vec())
    }

    fn contract(&self) -> &ModelContract {
        &self.contract
    }

    fn model_path(&self) -> Option<PathBuf> {
        None
    }

    fn display_name(&self) -> String {
        ModelSource::InMemory(Arc::clone(&self.bytes)).display_name()
    }
}

/// Front door for model bytes and contract, shared by every backend
#[derive(Debug)]
pub struct ModelManager {
    provider: Box<dyn ModelProvider>,
}

impl ModelManager {
    /// # Errors
    /// - `ModelLoad` when the contract cannot be resolved or is invalid
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        let provider: Box<dyn ModelProvider> = match &spec.source {
            ModelSource::External(path) => {
                Box::new(ExternalModelProvider::new(path, spec.contract.clone())?)
            },
            ModelSource::InMemory(bytes) => Box::new(InMemoryModelProvider::new(
                Arc::clone(bytes),
                spec.contract.clone().unwrap_or_default(),
            )?),
        };
        Ok(Self { provider })
    }

    #[must_use]
    pub fn with_provider(provider: Box<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    /// Load the weights, rejecting empty artifacts before any runtime sees them
    ///
    /// # Errors
    /// - `ModelLoad` when the bytes cannot be read or are empty
    pub fn load_model(&self) -> Result<Vec<u8>> {
        let data = self.provider.load_model_data()?;
        if data.is_empty() {
            return Err(BgRemovalError::model_load(format!(
                "Model {} is empty (0 bytes)",
                self.provider.display_name()
            )));
        }
        Ok(data)
    }

    #[must_use]
    pub fn contract(&self) -> &ModelContract {
        self.provider.contract()
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.provider.display_name()
    }

    #[must_use]
    pub fn model_path(&self) -> Option<PathBuf> {
        self.provider.model_path()
    }

    #[must_use]
    pub fn get_info(&self, size_bytes: usize) -> ModelInfo {
        let contract = self.contract();
        ModelInfo {
            name: contract.name.clone(),
            size_bytes,
            input_shape: contract.input_shape,
            output_shape: contract.output_shape,
        }
    }
}
