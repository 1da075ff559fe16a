//! Deterministic stand-in backend
//!
//! Scores each pixel by its luminance (bright = foreground) and emits output
//! in whatever form the model contract declares. Used by tests, benches and
//! CLI dry runs where no real weights are available. Fault injection knobs
//! cover load failures, inference failures, wrong output shapes and slow
//! forward passes.

use crate::{
    config::RemovalConfig,
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
    models::{ModelContract, ModelInfo, ModelManager, OutputKind},
};
use instant::{Duration, Instant};
use ndarray::Array4;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Logit magnitude for a fully bright or fully dark pixel
const LOGIT_SCALE: f32 = 12.0;
/// Logit assigned to classes that are neither background nor the first foreground class
const OTHER_CLASS_LOGIT: f32 = -10.0;

#[derive(Debug)]
pub struct MockBackend {
    contract: ModelContract,
    model_manager: Option<ModelManager>,
    initialized: bool,
    fail_init: bool,
    fail_inference: bool,
    output_shape_override: Option<(usize, usize, usize, usize)>,
    delay: Option<Duration>,
    loads: Arc<AtomicUsize>,
}

impl MockBackend {
    #[must_use]
    pub fn new(contract: ModelContract) -> Self {
        Self {
            contract,
            model_manager: None,
            initialized: false,
            fail_init: false,
            fail_inference: false,
            output_shape_override: None,
            delay: None,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Read (and validate) real model bytes on initialize, like a real backend
    #[must_use]
    pub fn with_model_manager(model_manager: ModelManager) -> Self {
        let mut backend = Self::new(model_manager.contract().clone());
        backend.model_manager = Some(model_manager);
        backend
    }

    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    #[must_use]
    pub fn failing_inference(mut self) -> Self {
        self.fail_inference = true;
        self
    }

    /// Emit tensors of this shape instead of the contract's output shape
    #[must_use]
    pub fn with_output_shape(mut self, shape: (usize, usize, usize, usize)) -> Self {
        self.output_shape_override = Some(shape);
        self
    }

    /// Sleep this long inside every forward pass
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter of successful model loads
    #[must_use]
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }

    /// Per-pixel foreground score in [0, 1] recovered from the normalized input
    fn luminance(&self, input: &Array4<f32>, y: usize, x: usize) -> f32 {
        let pre = &self.contract.preprocessing;
        let channel = |c: usize| {
            let normalized = input.get([0, c, y, x]).copied().unwrap_or(0.0);
            (normalized * pre.normalization_std[c] + pre.normalization_mean[c]).clamp(0.0, 1.0)
        };
        0.299 * channel(0) + 0.587 * channel(1) + 0.114 * channel(2)
    }

    #[allow(clippy::indexing_slicing)]
    fn generate_output(&self, input: &Array4<f32>) -> Array4<f32> {
        let (_, _, in_h, in_w) = input.dim();
        let shape = self
            .output_shape_override
            .unwrap_or(self.contract.output_shape);
        let (batch, channels, out_h, out_w) = shape;
        let foreground_class = self.contract.foreground_classes.first().copied().unwrap_or(1);

        let mut output = Array4::<f32>::zeros(shape);
        for y in 0..out_h {
            let src_y = (y * in_h / out_h).min(in_h.saturating_sub(1));
            for x in 0..out_w {
                let src_x = (x * in_w / out_w).min(in_w.saturating_sub(1));
                let score = self.luminance(input, src_y, src_x);
                let logit = LOGIT_SCALE * (score - 0.5);

                for b in 0..batch {
                    match (&self.contract.output_kind, channels) {
                        (OutputKind::ClassLabels { .. }, _) => {
                            let label = if score >= 0.5 { foreground_class } else { 0 };
                            output[[b, 0, y, x]] = label as f32;
                        },
                        (OutputKind::Probabilities, 1) => output[[b, 0, y, x]] = score,
                        (OutputKind::Logits, 1) => output[[b, 0, y, x]] = logit,
                        (kind, _) => {
                            for c in 0..channels {
                                output[[b, c, y, x]] = if c == foreground_class {
                                    logit
                                } else if c == 0 {
                                    -logit
                                } else {
                                    OTHER_CLASS_LOGIT
                                };
                            }
                            if *kind == OutputKind::Probabilities {
                                softmax_pixel(&mut output, b, y, x);
                            }
                        },
                    }
                }
            }
        }
        output
    }
}

#[allow(clippy::indexing_slicing)]
fn softmax_pixel(output: &mut Array4<f32>, b: usize, y: usize, x: usize) {
    let channels = output.dim().1;
    let max = (0..channels).fold(f32::NEG_INFINITY, |m, c| m.max(output[[b, c, y, x]]));
    let mut sum = 0.0;
    for c in 0..channels {
        let e = (output[[b, c, y, x]] - max).exp();
        output[[b, c, y, x]] = e;
        sum += e;
    }
    for c in 0..channels {
        output[[b, c, y, x]] /= sum;
    }
}

impl InferenceBackend for MockBackend {
    fn initialize(&mut self, _config: &RemovalConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        let start = Instant::now();

        if let Some(manager) = &self.model_manager {
            manager.load_model()?;
        }
        if self.fail_init {
            return Err(BgRemovalError::model_load(
                "Mock backend refused to load its model",
            ));
        }

        self.initialized = true;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(start.elapsed()))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(BgRemovalError::inference("Mock backend not initialized"));
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_inference {
            return Err(BgRemovalError::inference_error_with_provider(
                "mock",
                "Model inference",
                "simulated device fault",
                &["retry the request"],
            ));
        }
        Ok(self.generate_output(input))
    }

    fn contract(&self) -> &ModelContract {
        &self.contract
    }

    fn get_model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.contract.name.clone(),
            size_bytes: 0,
            input_shape: self.contract.input_shape,
            output_shape: self.contract.output_shape,
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelSpec;
    use tempfile::TempDir;

    fn uniform_input(contract: &ModelContract, value: f32) -> Array4<f32> {
        let (n, c, h, w) = contract.input_shape;
        let pre = &contract.preprocessing;
        let mut input = Array4::<f32>::zeros((n, c, h, w));
        for ch in 0..c {
            input
                .index_axis_mut(ndarray::Axis(1), ch)
                .fill((value - pre.normalization_mean[ch]) / pre.normalization_std[ch]);
        }
        input
    }

    #[test]
    fn test_bright_pixels_are_foreground() {
        let contract = ModelContract::binary("mock", 8);
        let mut backend = MockBackend::new(contract.clone());
        backend.initialize(&RemovalConfig::default()).unwrap();

        let bright = backend.infer(&uniform_input(&contract, 1.0)).unwrap();
        let dark = backend.infer(&uniform_input(&contract, 0.0)).unwrap();
        assert!(bright.iter().all(|&p| p > 0.99));
        assert!(dark.iter().all(|&p| p < 0.01));
    }

    #[test]
    fn test_output_shape_override() {
        let contract = ModelContract::binary("mock", 8);
        let mut backend = MockBackend::new(contract.clone()).with_output_shape((1, 1, 5, 7));
        backend.initialize(&RemovalConfig::default()).unwrap();
        let output = backend.infer(&uniform_input(&contract, 0.5)).unwrap();
        assert_eq!(output.dim(), (1, 1, 5, 7));
    }

    #[test]
    fn test_label_output() {
        let mut contract = ModelContract::deeplab_v3();
        contract.output_kind = OutputKind::ClassLabels { num_classes: 21 };
        contract.output_shape = (1, 1, 513, 513);
        let mut backend = MockBackend::new(contract.clone());
        backend.initialize(&RemovalConfig::default()).unwrap();

        let output = backend.infer(&uniform_input(&contract, 1.0)).unwrap();
        assert!(output.iter().all(|&label| label == 15.0));
    }

    #[test]
    fn test_uninitialized_infer_fails() {
        let contract = ModelContract::binary("mock", 8);
        let mut backend = MockBackend::new(contract.clone());
        assert!(backend.infer(&uniform_input(&contract, 0.0)).is_err());
    }

    #[test]
    fn test_empty_model_file_fails_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.onnx");
        std::fs::write(&path, b"").unwrap();

        let manager = ModelManager::from_spec(
            &ModelSpec::external(&path).with_contract(ModelContract::binary("empty", 8)),
        )
        .unwrap();
        let mut backend = MockBackend::with_model_manager(manager);
        let err = backend.initialize(&RemovalConfig::default()).unwrap_err();
        assert!(matches!(err, BgRemovalError::ModelLoad(_)));
        assert!(!backend.is_initialized());
        assert_eq!(backend.load_counter().load(Ordering::SeqCst), 0);
    }
}
