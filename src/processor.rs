//! Pipeline controller
//!
//! Drives one image through preprocessing, inference, mask building and
//! compositing. Every run records the states it passed through; a failure in
//! any stage ends the run in `Failed` with the stage's own error, unwrapped.
//! Cancellation is observed between stages, so an in-flight stage always
//! finishes and its output is discarded.

use crate::{
    compositor::Compositor,
    config::{CompositeRequest, RemovalConfig},
    error::{BgRemovalError, ErrorKind, Result},
    inference::{InferenceBackend, SegmentationEngine},
    mask::MaskBuilder,
    models::{ModelManager, ModelSpec},
    services::{ProcessingStage, ProgressReporter, ProgressTracker},
    types::{ImageBuffer, ProcessingMetadata, RemovalResult, SegmentationMask},
    utils::ImagePreprocessor,
};
use image::RgbaImage;
use instant::{Duration, Instant};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info as trace_info, instrument, span, Level};

/// States of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Preprocessing,
    Inferring,
    BuildingMask,
    Compositing,
    Done,
    Failed(ErrorKind),
}

impl PipelineState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Whether `next` may follow `self`
    ///
    /// Stages advance strictly in order; any non-terminal state may fail.
    #[must_use]
    pub fn can_transition_to(&self, next: &PipelineState) -> bool {
        match (self, next) {
            (current, Self::Failed(_)) => !current.is_terminal(),
            (Self::Idle, Self::Preprocessing)
            | (Self::Preprocessing, Self::Inferring)
            | (Self::Inferring, Self::BuildingMask)
            | (Self::BuildingMask, Self::Compositing)
            | (Self::Compositing, Self::Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Preprocessing => f.write_str("preprocessing"),
            Self::Inferring => f.write_str("inferring"),
            Self::BuildingMask => f.write_str("building-mask"),
            Self::Compositing => f.write_str("compositing"),
            Self::Done => f.write_str("done"),
            Self::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

/// Backend type enumeration for runtime selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendType {
    /// ONNX Runtime backend (supports GPU acceleration)
    Onnx,
    /// Tract backend (pure Rust, no external dependencies)
    Tract,
    /// Deterministic luminance-based backend for tests and dry runs
    Mock,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => f.write_str("onnx"),
            Self::Tract => f.write_str("tract"),
            Self::Mock => f.write_str("mock"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "tract" => Ok(Self::Tract),
            "mock" => Ok(Self::Mock),
            other => Err(BgRemovalError::invalid_config(format!(
                "Unknown backend '{other}'. Expected onnx, tract or mock"
            ))),
        }
    }
}

/// Factory trait for creating inference backends
pub trait BackendFactory: Send + Sync {
    /// Create a backend instance of the specified type with the given model manager
    ///
    /// # Errors
    /// - `InvalidConfig` when the backend was not compiled in
    fn create_backend(
        &self,
        backend_type: BackendType,
        model_manager: ModelManager,
    ) -> Result<Box<dyn InferenceBackend>>;

    /// List available backend types
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Builds whichever backends this build enables
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(
        &self,
        backend_type: BackendType,
        model_manager: ModelManager,
    ) -> Result<Box<dyn InferenceBackend>> {
        match backend_type {
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::new(model_manager))),
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::new(model_manager))),
            BackendType::Mock => Ok(Box::new(crate::backends::MockBackend::with_model_manager(
                model_manager,
            ))),
            #[allow(unreachable_patterns)]
            other => Err(BgRemovalError::invalid_config(format!(
                "Backend '{other}' is not compiled into this build"
            ))),
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        backends.push(BackendType::Mock);
        backends
    }
}

/// Outcome of one run together with the states it visited
#[derive(Debug)]
pub struct PipelineReport {
    pub result: Result<RemovalResult>,
    pub stages: Vec<PipelineState>,
}

impl PipelineReport {
    #[must_use]
    pub fn final_state(&self) -> Option<&PipelineState> {
        self.stages.last()
    }
}

/// Runs images through the segmentation pipeline
///
/// Cheap to share: the engine (and its loaded model) sits behind an `Arc`, so
/// any number of controllers and tasks can use the same weights.
pub struct PipelineController {
    engine: Arc<SegmentationEngine>,
    mask_builder: MaskBuilder,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("engine", &self.engine)
            .field("progress", &self.reporter.is_some())
            .finish()
    }
}

impl PipelineController {
    #[must_use]
    pub fn new(engine: Arc<SegmentationEngine>) -> Self {
        let mask_builder = MaskBuilder::new(engine.contract());
        Self {
            engine,
            mask_builder,
            reporter: None,
        }
    }

    /// Controller over a private engine built from `spec`
    ///
    /// # Errors
    /// - `InvalidConfig` for an invalid configuration or unavailable backend
    /// - `ModelLoad` when the model spec cannot be resolved
    pub fn from_spec(
        spec: &ModelSpec,
        backend_type: BackendType,
        config: RemovalConfig,
        factory: &dyn BackendFactory,
    ) -> Result<Self> {
        let engine = Self::build_engine(spec, backend_type, config, factory)?;
        Ok(Self::new(Arc::new(engine)))
    }

    /// Controller over the process-wide engine
    ///
    /// Only the first call's `spec`, backend and config take effect.
    ///
    /// # Errors
    /// - Same as [`PipelineController::from_spec`], on the first call only
    pub fn shared(
        spec: &ModelSpec,
        backend_type: BackendType,
        config: RemovalConfig,
        factory: &dyn BackendFactory,
    ) -> Result<Self> {
        let engine = SegmentationEngine::shared(|| {
            Self::build_engine(spec, backend_type, config, factory)
        })?;
        Ok(Self::new(engine))
    }

    fn build_engine(
        spec: &ModelSpec,
        backend_type: BackendType,
        config: RemovalConfig,
        factory: &dyn BackendFactory,
    ) -> Result<SegmentationEngine> {
        config.validate()?;
        let manager = ModelManager::from_spec(spec)?;
        info!(
            "Creating {backend_type} backend for model {}",
            manager.display_name()
        );
        let backend = factory.create_backend(backend_type, manager)?;
        Ok(SegmentationEngine::new(backend, config))
    }

    #[must_use]
    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<SegmentationEngine> {
        &self.engine
    }

    #[must_use]
    pub fn config(&self) -> &RemovalConfig {
        self.engine.config()
    }

    /// Load the model ahead of the first request
    ///
    /// # Errors
    /// - `ModelLoad` from the backend
    pub fn warm_up(&self) -> Result<Option<Duration>> {
        self.engine.ensure_loaded()
    }

    /// Remove the background from `image`
    ///
    /// # Errors
    /// - The failing stage's error, unchanged
    pub fn process(&self, image: ImageBuffer, request: &CompositeRequest) -> Result<RemovalResult> {
        self.run(image, request, None).result
    }

    /// Like [`PipelineController::process`], stopping at the next stage
    /// boundary once `cancel` fires
    ///
    /// # Errors
    /// - `Cancelled` when the token fired before the run completed
    pub fn process_with_cancellation(
        &self,
        image: ImageBuffer,
        request: &CompositeRequest,
        cancel: &CancellationToken,
    ) -> Result<RemovalResult> {
        self.run(image, request, Some(cancel)).result
    }

    /// Run on the blocking pool, bounded by the configured inference timeout
    ///
    /// An expired timeout is reported as an `Inference` error. The blocking
    /// run is told to stop at its next stage boundary and its output is
    /// dropped.
    ///
    /// # Errors
    /// - `Inference` on timeout or when the blocking task dies
    /// - `Cancelled` when `cancel` fires first
    pub async fn process_async(
        self: &Arc<Self>,
        image: ImageBuffer,
        request: CompositeRequest,
        cancel: CancellationToken,
    ) -> Result<RemovalResult> {
        let timeout = self.config().inference_timeout();
        let run_token = cancel.child_token();
        let controller = Arc::clone(self);
        let task_token = run_token.clone();
        let task = tokio::task::spawn_blocking(move || {
            controller.process_with_cancellation(image, &request, &task_token)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(BgRemovalError::inference(format!(
                "Pipeline task failed: {join_error}"
            ))),
            Err(_) => {
                run_token.cancel();
                warn!("Pipeline run exceeded {}ms", timeout.as_millis());
                Err(BgRemovalError::inference(format!(
                    "Inference timed out after {}ms",
                    timeout.as_millis()
                )))
            },
        }
    }

    /// Full run, returning the visited states alongside the result
    #[instrument(
        skip(self, image, request, cancel),
        fields(
            backend = %self.engine.backend_name(),
            model = %self.engine.contract().name,
            dimensions = %format!("{}x{}", image.width(), image.height()),
            mode = %request.mode.name()
        )
    )]
    pub fn run(
        &self,
        image: ImageBuffer,
        request: &CompositeRequest,
        cancel: Option<&CancellationToken>,
    ) -> PipelineReport {
        let mut run = PipelineRun::new(self, cancel);
        let result = self.execute(&mut run, image, request);
        match result {
            Ok((image, mask, original_dimensions)) => {
                run.advance(PipelineState::Done);
                run.metadata.timings.total_ms = elapsed_ms(run.started);
                run.tracker.report_stage(ProcessingStage::Completed);
                run.tracker.report_completion(&run.metadata.timings);
                trace_info!(
                    total_ms = run.metadata.timings.total_ms,
                    "Background removal complete"
                );
                let stages = run.metadata.stages.clone();
                PipelineReport {
                    result: Ok(RemovalResult {
                        image,
                        mask,
                        original_dimensions,
                        metadata: run.metadata,
                    }),
                    stages,
                }
            },
            Err(error) => {
                run.fail(&error);
                PipelineReport {
                    result: Err(error),
                    stages: run.metadata.stages,
                }
            },
        }
    }

    fn execute(
        &self,
        run: &mut PipelineRun<'_>,
        image: ImageBuffer,
        request: &CompositeRequest,
    ) -> Result<(RgbaImage, SegmentationMask, (u32, u32))> {
        run.check_cancelled()?;
        request.validate()?;
        image.ensure_not_empty()?;
        let original_dimensions = image.dimensions();
        let contract = self.engine.contract();

        run.advance(PipelineState::Preprocessing);
        run.tracker.report_stage(ProcessingStage::Preprocessing);
        let input = {
            let _span = span!(
                Level::DEBUG,
                "preprocessing",
                original_width = %original_dimensions.0,
                original_height = %original_dimensions.1
            )
            .entered();
            let start = Instant::now();
            let input = ImagePreprocessor::preprocess(&image, &contract.preprocessing)?;
            run.metadata.timings.preprocessing_ms = elapsed_ms(start);
            input
        };
        run.check_cancelled()?;

        run.advance(PipelineState::Inferring);
        if !self.engine.is_loaded() {
            run.tracker.report_stage(ProcessingStage::Initialization);
        }
        run.tracker.report_stage(ProcessingStage::Inference);
        let outcome = {
            let _span = span!(
                Level::INFO,
                "inference",
                backend = %self.engine.backend_name(),
                model = %contract.name
            )
            .entered();
            self.engine.segment(&input.tensor)?
        };
        if let Some(load_time) = outcome.model_load_time {
            run.metadata.timings.model_load_ms = duration_ms(load_time);
        }
        run.metadata.timings.inference_ms = duration_ms(outcome.inference_time);
        run.check_cancelled()?;

        run.advance(PipelineState::BuildingMask);
        run.tracker.report_stage(ProcessingStage::MaskGeneration);
        let mask = {
            let _span = span!(
                Level::DEBUG,
                "mask",
                threshold = %request.threshold,
                feather_radius = %request.feather_radius
            )
            .entered();
            let start = Instant::now();
            let mask = self.mask_builder.build(
                &outcome.result,
                input.letterbox.as_ref(),
                input.original_dimensions,
                request.threshold,
                request.feather_radius,
            )?;
            run.metadata.timings.mask_ms = elapsed_ms(start);
            mask
        };
        drop(outcome);
        drop(input);
        run.check_cancelled()?;

        run.advance(PipelineState::Compositing);
        run.tracker.report_stage(ProcessingStage::Compositing);
        let composited = {
            let _span = span!(Level::DEBUG, "compositing", mode = %request.mode.name()).entered();
            let start = Instant::now();
            let composited = Compositor::composite(&image, &mask, &request.mode)?;
            run.metadata.timings.compositing_ms = elapsed_ms(start);
            composited
        };
        run.check_cancelled()?;

        if self.config().debug {
            let stats = mask.statistics();
            debug!(
                "Mask covers {:.1}% of {}x{}",
                stats.foreground_ratio * 100.0,
                original_dimensions.0,
                original_dimensions.1
            );
        }

        Ok((composited, mask, original_dimensions))
    }
}

/// Per-run bookkeeping
struct PipelineRun<'a> {
    state: PipelineState,
    metadata: ProcessingMetadata,
    tracker: ProgressTracker,
    cancel: Option<&'a CancellationToken>,
    started: Instant,
}

impl<'a> PipelineRun<'a> {
    fn new(controller: &PipelineController, cancel: Option<&'a CancellationToken>) -> Self {
        let tracker = match &controller.reporter {
            Some(reporter) => ProgressTracker::new(Arc::clone(reporter)),
            None => ProgressTracker::no_op(),
        };
        Self {
            state: PipelineState::Idle,
            metadata: ProcessingMetadata::new(
                controller.engine.backend_name().to_string(),
                controller.engine.contract().name.clone(),
            ),
            tracker,
            cancel,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "illegal pipeline transition {} -> {next}",
            self.state
        );
        debug!("Pipeline {} -> {next}", self.state);
        self.metadata.stages.push(next.clone());
        self.state = next;
    }

    fn fail(&mut self, error: &BgRemovalError) {
        if self.state.is_terminal() {
            return;
        }
        warn!("Pipeline failed while {}: {error}", self.state);
        self.tracker.report_error(&error.to_string());
        self.advance(PipelineState::Failed(error.kind()));
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(BgRemovalError::cancelled(format!(
                "Cancelled after {}",
                self.state
            ))),
            _ => Ok(()),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    duration_ms(start.elapsed())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
