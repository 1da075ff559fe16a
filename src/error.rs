//! Error types for background removal operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for background removal operations
pub type Result<T> = std::result::Result<T, BgRemovalError>;

/// Error taxonomy for the segmentation and compositing pipeline
#[derive(Error, Debug)]
pub enum BgRemovalError {
    /// Malformed or empty input image (caller error, never retried automatically)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Model weights missing, empty or corrupt
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// Forward pass fault or timeout (per request, safe to retry)
    #[error("Inference error: {0}")]
    Inference(String),

    /// Shape bookkeeping violated between pipeline stages
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Request was cancelled; the in-flight stage finished and its output was discarded
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image codec errors
    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),
}

/// Stable error tag reported across the bridge boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInputError,
    InvalidConfigError,
    ModelLoadError,
    InferenceError,
    DimensionMismatchError,
    CancelledError,
    IoError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidInputError => "InvalidInputError",
            Self::InvalidConfigError => "InvalidConfigError",
            Self::ModelLoadError => "ModelLoadError",
            Self::InferenceError => "InferenceError",
            Self::DimensionMismatchError => "DimensionMismatchError",
            Self::CancelledError => "CancelledError",
            Self::IoError => "IoError",
        };
        f.write_str(name)
    }
}

impl BgRemovalError {
    /// Create a new invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new model load error
    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoad(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new dimension mismatch error
    pub fn dimension_mismatch<S: Into<String>>(msg: S) -> Self {
        Self::DimensionMismatch(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create model error with troubleshooting context
    pub fn model_error_with_context<P: AsRef<std::path::Path>>(
        operation: &str,
        model_path: P,
        error: &str,
        suggestions: &[&str],
    ) -> Self {
        let path_display = model_path.as_ref().display();
        let suggestion_text = if suggestions.is_empty() {
            String::new()
        } else {
            format!(" Suggestions: {}", suggestions.join(", "))
        };

        Self::ModelLoad(format!(
            "Failed to {operation} model '{path_display}': {error}.{suggestion_text}"
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {rec}"),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range}).{recommendation}"
        ))
    }

    /// Create inference error with provider context
    pub fn inference_error_with_provider(
        provider: &str,
        operation: &str,
        error: &str,
        fallback_suggestions: &[&str],
    ) -> Self {
        let suggestions = if fallback_suggestions.is_empty() {
            String::new()
        } else {
            format!(" Try: {}", fallback_suggestions.join(" or "))
        };

        Self::Inference(format!(
            "{operation} failed using '{provider}' provider: {error}.{suggestions}"
        ))
    }

    /// Stable tag for this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::Image(_) => ErrorKind::InvalidInputError,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfigError,
            Self::ModelLoad(_) => ErrorKind::ModelLoadError,
            Self::Inference(_) => ErrorKind::InferenceError,
            Self::DimensionMismatch(_) => ErrorKind::DimensionMismatchError,
            Self::Cancelled(_) => ErrorKind::CancelledError,
            Self::Io(_) => ErrorKind::IoError,
        }
    }

    /// Whether the caller may retry the same request (possibly with backoff)
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Inference(_))
    }
}
