//! Inference backend abstraction and the process-wide segmentation engine
//!
//! Backends are treated as non-reentrant (`infer` takes `&mut self`). The
//! engine owns one backend behind a single mutex which doubles as the
//! initialization lock and the request queue: the first caller loads the
//! model while concurrent callers wait, and forward passes run one at a time.

use crate::{
    config::RemovalConfig,
    error::{BgRemovalError, Result},
    models::{ModelContract, ModelInfo, OutputKind},
    types::{ResultKind, SegmentationResult},
};
use instant::{Duration, Instant};
use ndarray::{Array4, Axis};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, OnceLock,
};

/// Trait for inference backends
pub trait InferenceBackend: Send {
    /// Initialize the backend with the given configuration
    ///
    /// Returns the model load time, or `None` when already initialized.
    ///
    /// # Errors
    /// - `ModelLoad` when the weights are missing, empty or rejected by the runtime.
    ///   A failed call must leave the backend uninitialized.
    fn initialize(&mut self, config: &RemovalConfig) -> Result<Option<Duration>>;

    /// Run inference on the input tensor
    ///
    /// # Errors
    /// - `Inference` for runtime faults (recoverable per request)
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Tensor contract of the model this backend serves
    fn contract(&self) -> &ModelContract;

    /// Get the expected input shape for this backend
    fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.contract().input_shape
    }

    /// Get the expected output shape for this backend
    fn output_shape(&self) -> (usize, usize, usize, usize) {
        self.contract().output_shape
    }

    /// Get model information for this backend
    fn get_model_info(&self) -> ModelInfo;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;

    /// Short backend identifier for logs and metadata
    fn backend_name(&self) -> &'static str;
}

/// Output of one engine call
#[derive(Debug)]
pub struct InferenceOutcome {
    pub result: SegmentationResult,
    /// Set only on the call that performed the model load
    pub model_load_time: Option<Duration>,
    pub inference_time: Duration,
}

/// Loaded-once model wrapper that serializes access to a backend
pub struct SegmentationEngine {
    backend: Mutex<Box<dyn InferenceBackend>>,
    /// Mirrors the backend's initialized state so callers can check it without queueing
    loaded: AtomicBool,
    contract: ModelContract,
    config: RemovalConfig,
    backend_name: &'static str,
}

impl std::fmt::Debug for SegmentationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationEngine")
            .field("backend", &self.backend_name)
            .field("model", &self.contract.name)
            .finish_non_exhaustive()
    }
}

static SHARED_ENGINE: OnceLock<Arc<SegmentationEngine>> = OnceLock::new();
static SHARED_ENGINE_INIT: Mutex<()> = Mutex::new(());

impl SegmentationEngine {
    /// Wrap a backend; the model is loaded lazily on first use
    #[must_use]
    pub fn new(backend: Box<dyn InferenceBackend>, config: RemovalConfig) -> Self {
        let contract = backend.contract().clone();
        let backend_name = backend.backend_name();
        Self {
            loaded: AtomicBool::new(backend.is_initialized()),
            backend: Mutex::new(backend),
            contract,
            config,
            backend_name,
        }
    }

    /// Process-wide engine, created by `factory` on the first call only
    ///
    /// Later calls ignore their factory and return the existing engine. The
    /// engine lives until process exit.
    ///
    /// # Errors
    /// - Whatever `factory` returns; a failed factory leaves nothing installed
    pub fn shared<F>(factory: F) -> Result<Arc<Self>>
    where
        F: FnOnce() -> Result<Self>,
    {
        if let Some(engine) = SHARED_ENGINE.get() {
            return Ok(Arc::clone(engine));
        }

        let _guard = SHARED_ENGINE_INIT
            .lock()
            .map_err(|_| BgRemovalError::model_load("Shared engine initialization lock poisoned"))?;
        if let Some(engine) = SHARED_ENGINE.get() {
            return Ok(Arc::clone(engine));
        }

        let engine = Arc::new(factory()?);
        log::info!("Installing process-wide segmentation engine: {engine:?}");
        let _ = SHARED_ENGINE.set(Arc::clone(&engine));
        Ok(engine)
    }

    #[must_use]
    pub fn contract(&self) -> &ModelContract {
        &self.contract
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    #[must_use]
    pub fn config(&self) -> &RemovalConfig {
        &self.config
    }

    /// Whether the model weights are currently loaded
    ///
    /// Never waits on a forward pass in flight.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Load the model if needed
    ///
    /// # Errors
    /// - `ModelLoad` from the backend; the engine stays unloaded and the next
    ///   call tries again
    pub fn ensure_loaded(&self) -> Result<Option<Duration>> {
        let mut backend = self.lock_backend()?;
        self.load_locked(&mut backend)
    }

    /// Run one forward pass and interpret the output per the model contract
    ///
    /// # Errors
    /// - `DimensionMismatch` when the input tensor or the output channel count
    ///   disagree with the contract
    /// - `ModelLoad` when the lazy model load fails
    /// - `Inference` for backend faults or outputs that violate the
    ///   probability invariants
    pub fn segment(&self, input: &Array4<f32>) -> Result<InferenceOutcome> {
        if input.dim() != self.contract.input_shape {
            return Err(BgRemovalError::dimension_mismatch(format!(
                "Input tensor {:?} does not match model input {:?}",
                input.dim(),
                self.contract.input_shape
            )));
        }

        let (raw, model_load_time, inference_time) = {
            let mut backend = self.lock_backend()?;
            let model_load_time = self.load_locked(&mut backend)?;
            let start = Instant::now();
            let raw = backend.infer(input)?;
            (raw, model_load_time, start.elapsed())
        };

        log::debug!(
            "{} forward pass produced {:?} in {:.2}ms",
            self.backend_name,
            raw.dim(),
            inference_time.as_secs_f64() * 1000.0
        );

        let result = self.interpret_output(raw)?;
        Ok(InferenceOutcome {
            result,
            model_load_time,
            inference_time,
        })
    }

    fn lock_backend(&self) -> Result<MutexGuard<'_, Box<dyn InferenceBackend>>> {
        self.backend
            .lock()
            .map_err(|_| BgRemovalError::inference("Inference queue poisoned by an earlier panic"))
    }

    fn load_locked(&self, backend: &mut Box<dyn InferenceBackend>) -> Result<Option<Duration>> {
        if backend.is_initialized() {
            return Ok(None);
        }
        log::info!("Loading model with {} backend", backend.backend_name());
        let load_time = backend.initialize(&self.config)?;
        self.loaded.store(true, Ordering::Release);
        if let Some(time) = load_time {
            log::info!("Model loaded in {:.0}ms", time.as_secs_f64() * 1000.0);
        }
        Ok(load_time)
    }

    /// Convert raw network output into validated probabilities
    fn interpret_output(&self, raw: Array4<f32>) -> Result<SegmentationResult> {
        let channels = raw.dim().1;
        let expected_channels = self.contract.output_shape.1;
        if channels != expected_channels {
            return Err(BgRemovalError::dimension_mismatch(format!(
                "Model produced {channels} channels, contract declares {expected_channels}"
            )));
        }

        let probabilities = match &self.contract.output_kind {
            OutputKind::Probabilities => clamp_probabilities(raw),
            OutputKind::Logits if channels == 1 => sigmoid(raw),
            OutputKind::Logits => softmax_channels(raw),
            OutputKind::ClassLabels { num_classes } => one_hot_labels(&raw, *num_classes)?,
        };

        let kind = if self.contract.num_classes() == 1 {
            ResultKind::Binary
        } else {
            ResultKind::MultiClass {
                foreground_classes: self.contract.foreground_classes.clone(),
            }
        };

        SegmentationResult::new(probabilities, kind)
    }
}

/// Absorb float noise at the bounds; NaN stays NaN and fails validation
fn clamp_probabilities(mut values: Array4<f32>) -> Array4<f32> {
    values.mapv_inplace(|p| if p.is_nan() { p } else { p.clamp(0.0, 1.0) });
    values
}

fn sigmoid(mut logits: Array4<f32>) -> Array4<f32> {
    logits.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
    logits
}

/// Numerically stable softmax over the channel axis of an NCHW tensor
fn softmax_channels(mut logits: Array4<f32>) -> Array4<f32> {
    for mut lane in logits.lanes_mut(Axis(1)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 && sum.is_finite() {
            lane.mapv_inplace(|v| v / sum);
        }
    }
    logits
}

/// Expand a 1-channel label map into one-hot class probabilities
fn one_hot_labels(labels: &Array4<f32>, num_classes: usize) -> Result<Array4<f32>> {
    let (batch, _, height, width) = labels.dim();
    let mut one_hot = Array4::<f32>::zeros((batch, num_classes, height, width));

    for ((b, _, y, x), &label) in labels.indexed_iter() {
        let rounded = label.round();
        if !rounded.is_finite() || rounded < 0.0 || rounded as usize >= num_classes {
            return Err(BgRemovalError::inference(format!(
                "Class label {label} outside 0..{num_classes}"
            )));
        }
        if let Some(cell) = one_hot.get_mut([b, rounded as usize, y, x]) {
            *cell = 1.0;
        }
    }

    Ok(one_hot)
}
