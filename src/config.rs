//! Configuration types for background removal operations

use crate::error::{BgRemovalError, Result};
use crate::types::ImageBuffer;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default foreground threshold applied to mask probabilities
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Largest supported edge feathering radius in pixels
pub const MAX_FEATHER_RADIUS: u32 = 255;

/// Default upper bound on one pipeline run
pub const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 30_000;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Neural Engine / GPU via `CoreML`
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl std::str::FromStr for ExecutionProvider {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            other => Err(BgRemovalError::invalid_config(format!(
                "Unknown execution provider '{other}' (expected auto, cpu, cuda or coreml)"
            ))),
        }
    }
}

/// What to put behind the foreground
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OutputMode {
    /// Keep RGB, write the mask into alpha
    #[default]
    Transparent,
    /// Blend against a single straight-alpha RGBA colour
    SolidColor([u8; 4]),
    /// Blend against another image (resized to the input if needed)
    ReplacementImage(ImageBuffer),
}

impl OutputMode {
    /// Short name used in logs and bridge payloads
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transparent => "transparent",
            Self::SolidColor(_) => "solidColor",
            Self::ReplacementImage(_) => "replacementImage",
        }
    }
}

/// Per-request compositing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRequest {
    pub mode: OutputMode,
    /// Edge smoothing radius in pixels; 0 keeps the hard threshold mask
    pub feather_radius: u32,
    /// Foreground cut-off in [0, 1]; probabilities `>=` threshold are foreground
    pub threshold: f32,
}

impl Default for CompositeRequest {
    fn default() -> Self {
        Self {
            mode: OutputMode::Transparent,
            feather_radius: 0,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl CompositeRequest {
    #[must_use]
    pub fn transparent() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn solid_color(color: [u8; 4]) -> Self {
        Self {
            mode: OutputMode::SolidColor(color),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn replacement_image(image: ImageBuffer) -> Self {
        Self {
            mode: OutputMode::ReplacementImage(image),
            ..Self::default()
        }
    }

    /// Radii above [`MAX_FEATHER_RADIUS`] fail validation
    #[must_use]
    pub fn with_feather_radius(mut self, radius: u32) -> Self {
        self.feather_radius = radius;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// # Errors
    /// - `InvalidConfig` when the threshold is outside [0, 1] or not finite
    /// - `InvalidInput` when the replacement image is empty
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(BgRemovalError::config_value_error(
                "threshold",
                self.threshold,
                "0.0-1.0",
                Some(DEFAULT_THRESHOLD),
            ));
        }
        validate_feather_radius("feather radius", self.feather_radius)?;
        if let OutputMode::ReplacementImage(image) = &self.mode {
            image.ensure_not_empty()?;
        }
        Ok(())
    }
}

pub(crate) fn validate_feather_radius(parameter: &str, radius: u32) -> Result<()> {
    if radius > MAX_FEATHER_RADIUS {
        return Err(BgRemovalError::config_value_error(
            parameter,
            radius,
            "0-255",
            Some(0),
        ));
    }
    Ok(())
}

/// Parse `#RRGGBB` or `#RRGGBBAA` (leading `#` optional)
///
/// # Errors
/// - `InvalidConfig` on any other shape
pub fn parse_hex_color(value: &str) -> Result<[u8; 4]> {
    let hex = value.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return Err(BgRemovalError::invalid_config(format!(
            "Colour '{value}' must be #RRGGBB or #RRGGBBAA"
        )));
    }

    let channel = |i: usize| {
        hex.get(i..i + 2)
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .ok_or_else(|| BgRemovalError::invalid_config(format!("Invalid hex colour '{value}'")))
    };

    let alpha = if hex.len() == 8 { channel(6)? } else { u8::MAX };
    Ok([channel(0)?, channel(2)?, channel(4)?, alpha])
}

/// Engine and pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalConfig {
    /// Execution provider for ONNX Runtime
    pub execution_provider: ExecutionProvider,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,

    /// Number of inter-op threads for inference (0 = auto)
    pub inter_threads: usize,

    /// Upper bound for one async pipeline run; expiry is an inference error
    pub inference_timeout_ms: u64,

    /// Threshold used when a request does not specify one
    pub default_threshold: f32,

    /// Feather radius used when a request does not specify one
    pub default_feather_radius: u32,

    /// Enable debug mode (additional logging and validation)
    pub debug: bool,
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            execution_provider: ExecutionProvider::default(),
            intra_threads: 0,
            inter_threads: 0,
            inference_timeout_ms: DEFAULT_INFERENCE_TIMEOUT_MS,
            default_threshold: DEFAULT_THRESHOLD,
            default_feather_radius: 0,
            debug: false,
        }
    }
}

impl RemovalConfig {
    /// Create a new configuration builder
    ///
    /// # Examples
    /// ```rust
    /// use bgremover::{ExecutionProvider, RemovalConfig};
    ///
    /// let config = RemovalConfig::builder()
    ///     .execution_provider(ExecutionProvider::Cpu)
    ///     .default_threshold(0.6)
    ///     .num_threads(4)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.intra_threads, 4);
    /// ```
    #[must_use]
    pub fn builder() -> RemovalConfigBuilder {
        RemovalConfigBuilder::default()
    }

    #[must_use]
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Threshold outside [0, 1]
    /// - Zero timeout
    ///
    /// # Examples
    /// ```rust
    /// use bgremover::RemovalConfig;
    ///
    /// let mut config = RemovalConfig::default();
    /// assert!(config.validate().is_ok());
    ///
    /// config.default_threshold = 1.5;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        if !self.default_threshold.is_finite() || !(0.0..=1.0).contains(&self.default_threshold) {
            return Err(BgRemovalError::config_value_error(
                "default threshold",
                self.default_threshold,
                "0.0-1.0",
                Some(DEFAULT_THRESHOLD),
            ));
        }

        validate_feather_radius("default feather radius", self.default_feather_radius)?;

        if self.inference_timeout_ms == 0 {
            return Err(BgRemovalError::config_value_error(
                "inference timeout (ms)",
                self.inference_timeout_ms,
                "1-",
                Some(DEFAULT_INFERENCE_TIMEOUT_MS),
            ));
        }

        Ok(())
    }

    /// Request carrying this configuration's defaults and the given mode
    #[must_use]
    pub fn request(&self, mode: OutputMode) -> CompositeRequest {
        CompositeRequest {
            mode,
            feather_radius: self.default_feather_radius,
            threshold: self.default_threshold,
        }
    }
}

/// Builder for `RemovalConfig`
#[derive(Debug, Default)]
pub struct RemovalConfigBuilder {
    config: RemovalConfig,
}

impl RemovalConfigBuilder {
    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn inter_threads(mut self, threads: usize) -> Self {
        self.config.inter_threads = threads;
        self
    }

    /// Set both intra and inter threads (inter = threads / 2, minimum 1; 0 = auto)
    #[must_use]
    pub fn num_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self.config.inter_threads = if threads > 0 { (threads / 2).max(1) } else { 0 };
        self
    }

    #[must_use]
    pub fn inference_timeout(mut self, timeout: Duration) -> Self {
        self.config.inference_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn default_threshold(mut self, threshold: f32) -> Self {
        self.config.default_threshold = threshold;
        self
    }

    #[must_use]
    pub fn default_feather_radius(mut self, radius: u32) -> Self {
        self.config.default_feather_radius = radius;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    /// - Any failure reported by [`RemovalConfig::validate`]
    pub fn build(self) -> Result<RemovalConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
