#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # bgremover
//!
//! On-device background removal: a semantic segmentation network predicts
//! per-pixel foreground probabilities, which are turned into a mask at the
//! original resolution and used to composite the subject over a transparent,
//! solid-colour or replacement background.
//!
//! The pipeline is strictly sequential per image:
//!
//! ```text
//! ImageBuffer -> ImagePreprocessor -> SegmentationEngine -> MaskBuilder -> Compositor
//! ```
//!
//! One model is loaded per process (lazily, exactly once) and shared by all
//! requests; everything else is per request.
//!
//! ## Features
//!
//! - **Backends**: ONNX Runtime (`onnx`, CUDA/CoreML/CPU) and Tract (`tract`,
//!   pure Rust), plus a deterministic mock backend for tests
//! - **Models**: DeepLabV3-style multi-class models (person class selects the
//!   foreground) or single-channel binary mattes, described by a
//!   [`ModelContract`] that can live in a `<model>.json` side-car
//! - **Output modes**: transparent, solid colour, replacement image, with
//!   optional edge feathering
//! - **Async API** with per-request timeouts and cooperative cancellation
//! - **Host bridges**: typed and legacy (JSON + callbacks) adapters
//! - **CLI** behind the `cli` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bgremover::{
//!     BackendType, CompositeRequest, DefaultBackendFactory, ModelSpec, PipelineController,
//!     RemovalConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let controller = Arc::new(PipelineController::from_spec(
//!     &ModelSpec::external("deeplabv3.onnx"),
//!     BackendType::Onnx,
//!     RemovalConfig::default(),
//!     &DefaultBackendFactory,
//! )?);
//!
//! let file = tokio::fs::File::open("portrait.jpg").await?;
//! let result = bgremover::remove_background_from_reader(
//!     file,
//!     &controller,
//!     CompositeRequest::transparent().with_feather_radius(2),
//! )
//! .await?;
//! result.save_png("portrait_no_bg.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend
//! - `tract` (default): Pure Rust backend
//! - `cli` (default): command-line interface and tracing subscriber setup
//! - `tracing-json`: JSON log output for the CLI

pub mod backends;
pub mod bridge;
#[cfg(feature = "cli")]
pub mod cli;
pub mod compositor;
pub mod config;
pub mod error;
pub mod inference;
pub mod mask;
pub mod models;
pub mod processor;
pub mod services;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;

use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub use backends::MockBackend;
#[cfg(feature = "onnx")]
pub use backends::OnnxBackend;
#[cfg(feature = "tract")]
pub use backends::TractBackend;
pub use bridge::{
    BackgroundMode, BackgroundRemover, BridgeError, ImageOutput, ImageSource, LegacyBridge,
    OutputPayload, OutputTarget, RemoveBackgroundOptions, TypedBridge,
};
pub use compositor::Compositor;
pub use config::{
    parse_hex_color, CompositeRequest, ExecutionProvider, OutputMode, RemovalConfig,
    RemovalConfigBuilder, MAX_FEATHER_RADIUS,
};
pub use error::{BgRemovalError, ErrorKind, Result};
pub use inference::{InferenceBackend, InferenceOutcome, SegmentationEngine};
pub use mask::MaskBuilder;
pub use models::{
    ModelContract, ModelInfo, ModelManager, ModelSource, ModelSpec, OutputKind,
    PreprocessingConfig,
};
pub use processor::{
    BackendFactory, BackendType, DefaultBackendFactory, PipelineController, PipelineReport,
    PipelineState,
};
pub use services::{
    ConsoleProgressReporter, ImageIOService, NoOpProgressReporter, ProcessingStage,
    ProgressReporter, ProgressTracker, ProgressUpdate,
};
pub use types::{
    ImageBuffer, MaskStatistics, PixelFormat, ProcessingMetadata, ProcessingTimings,
    RemovalResult, ResultKind, SegmentationMask, SegmentationResult,
};
pub use utils::{ImagePreprocessor, LetterboxTransform};

#[cfg(feature = "cli")]
pub use tracing_config::{TracingConfig, TracingFormat};

/// Remove the background from encoded image bytes (PNG or JPEG)
///
/// # Examples
/// ```rust,no_run
/// use bgremover::{CompositeRequest, PipelineController};
/// use std::sync::Arc;
///
/// # async fn example(controller: Arc<PipelineController>, upload: Vec<u8>) -> anyhow::Result<()> {
/// let result = bgremover::remove_background_from_bytes(
///     &upload,
///     &controller,
///     CompositeRequest::solid_color([255, 255, 255, 255]),
/// )
/// .await?;
/// let png = result.to_png_bytes()?;
/// # Ok(())
/// # }
/// ```
pub async fn remove_background_from_bytes(
    image_bytes: &[u8],
    controller: &Arc<PipelineController>,
    request: CompositeRequest,
) -> Result<RemovalResult> {
    let image = ImageIOService::load_from_bytes(image_bytes)?;
    remove_background_from_buffer(image, controller, request).await
}

/// Remove the background from an already decoded image
pub async fn remove_background_from_image(
    image: image::DynamicImage,
    controller: &Arc<PipelineController>,
    request: CompositeRequest,
) -> Result<RemovalResult> {
    remove_background_from_buffer(ImageBuffer::from_dynamic(image), controller, request).await
}

/// Remove the background from raw pixels
pub async fn remove_background_from_buffer(
    image: ImageBuffer,
    controller: &Arc<PipelineController>,
    request: CompositeRequest,
) -> Result<RemovalResult> {
    controller
        .process_async(image, request, CancellationToken::new())
        .await
}

/// Read an encoded image from `reader` and remove its background
pub async fn remove_background_from_reader<R: AsyncRead + Unpin>(
    reader: R,
    controller: &Arc<PipelineController>,
    request: CompositeRequest,
) -> Result<RemovalResult> {
    let image = ImageIOService::load_from_reader(reader).await?;
    remove_background_from_buffer(image, controller, request).await
}
