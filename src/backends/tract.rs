//! Tract backend: pure Rust ONNX inference on the CPU
//!
//! No native runtime is linked, which keeps this backend portable to targets
//! where ONNX Runtime is unavailable. Input facts are pinned to the model
//! contract so the graph is fully typed before optimization.

use crate::config::RemovalConfig;
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelContract, ModelInfo, ModelManager};
use ndarray::Array4;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

// Use instant crate for cross-platform time compatibility
use instant::{Duration, Instant};

/// Tract backend for running segmentation models using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model: Option<TractModel>,
    model_manager: ModelManager,
    model_size_bytes: usize,
}

impl TractBackend {
    /// List Tract execution providers with availability status and descriptions
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        log::debug!("Tract backend on {}/{}", std::env::consts::OS, std::env::consts::ARCH);
        vec![(
            "CPU".to_string(),
            true,
            "Pure Rust CPU inference with no external dependencies".to_string(),
        )]
    }

    /// Create a Tract backend for the model behind `model_manager`
    #[must_use]
    pub fn new(model_manager: ModelManager) -> Self {
        Self {
            model: None,
            model_manager,
            model_size_bytes: 0,
        }
    }

    /// Load and optimize the model
    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();
        let model_data = self.model_manager.load_model()?;
        let name = self.model_manager.display_name();
        let (n, c, h, w) = self.model_manager.contract().input_shape;

        log::info!(
            "Initializing Tract backend for {name} ({:.2} MB)",
            model_data.len() as f64 / (1024.0 * 1024.0)
        );

        let load_error = |stage: &str, e: &dyn std::fmt::Display| {
            BgRemovalError::model_error_with_context(
                stage,
                self.model_manager
                    .model_path()
                    .unwrap_or_else(|| name.clone().into()),
                &e.to_string(),
                &["verify the file is a valid ONNX export", "check the contract input shape"],
            )
        };

        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(&model_data))
            .map_err(|e| load_error("parse", &e))?
            .with_input_fact(0, f32::fact([n, c, h, w]).into())
            .map_err(|e| load_error("type", &e))?
            .into_optimized()
            .map_err(|e| load_error("optimize", &e))?
            .into_runnable()
            .map_err(|e| load_error("prepare", &e))?;

        self.model = Some(model);
        self.model_size_bytes = model_data.len();

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Tract backend initialized in {:.2}ms",
            model_load_time.as_secs_f64() * 1000.0
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self, _config: &RemovalConfig) -> Result<Option<Duration>> {
        if self.model.is_some() {
            return Ok(None);
        }
        self.load_model().map(Some)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| BgRemovalError::inference("Tract model not initialized"))?;

        log::debug!("Running Tract inference on {:?}", input.shape());
        let inference_start = Instant::now();

        let input_tensor = Tensor::from(input.clone());
        let outputs = model
            .run(tvec![input_tensor.into()])
            .map_err(|e| BgRemovalError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| BgRemovalError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output_data = output_tensor.to_array_view::<f32>().map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert output tensor: {e}"))
        })?;

        let output_array = output_data
            .to_owned()
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| {
                BgRemovalError::inference(format!(
                    "Expected 4D output tensor, got {:?}: {e}",
                    output_tensor.shape()
                ))
            })?;

        log::debug!(
            "Tract inference completed in {:.2}ms, output {:?}",
            inference_start.elapsed().as_secs_f64() * 1000.0,
            output_array.shape()
        );

        Ok(output_array)
    }

    fn contract(&self) -> &ModelContract {
        self.model_manager.contract()
    }

    fn get_model_info(&self) -> ModelInfo {
        self.model_manager.get_info(self.model_size_bytes)
    }

    fn is_initialized(&self) -> bool {
        self.model.is_some()
    }

    fn backend_name(&self) -> &'static str {
        "tract"
    }
}
