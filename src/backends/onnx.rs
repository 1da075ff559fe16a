//! ONNX Runtime backend
//!
//! Runs the segmentation network through ONNX Runtime with CUDA, `CoreML` or
//! CPU execution providers. Hardware providers are only registered when the
//! runtime reports them available; otherwise the session falls back to CPU.

use crate::config::{ExecutionProvider, RemovalConfig};
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelContract, ModelInfo, ModelManager};
use instant::{Duration, Instant};
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session};
use ort::{self, value::Value};

/// ONNX Runtime backend for running segmentation models
#[derive(Debug)]
pub struct OnnxBackend {
    session: Option<Session>,
    model_manager: ModelManager,
    model_size_bytes: usize,
}

fn cuda_available() -> bool {
    OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false)
}

fn coreml_available() -> bool {
    OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false)
}

fn session_error(step: &str, e: impl std::fmt::Display) -> BgRemovalError {
    BgRemovalError::model_load(format!("Failed to {step}: {e}"))
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8)
}

impl OnnxBackend {
    /// List ONNX Runtime execution providers with availability status and descriptions
    ///
    /// # Examples
    /// ```rust,no_run
    /// use bgremover::backends::OnnxBackend;
    ///
    /// for (name, available, description) in OnnxBackend::list_providers() {
    ///     println!("{name}: {available} - {description}");
    /// }
    /// ```
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        log::debug!(
            "ONNX Runtime on {}/{} with {} cores",
            std::env::consts::OS,
            std::env::consts::ARCH,
            default_parallelism()
        );

        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                cuda_available(),
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                coreml_available(),
                "Apple Neural Engine / GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    /// Create an ONNX backend for the model behind `model_manager`
    #[must_use]
    pub fn new(model_manager: ModelManager) -> Self {
        Self {
            session: None,
            model_manager,
            model_size_bytes: 0,
        }
    }

    /// Hardware providers to register, in priority order
    fn execution_providers(provider: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
        let mut providers = Vec::new();
        let want_cuda = matches!(provider, ExecutionProvider::Auto | ExecutionProvider::Cuda);
        let want_coreml = matches!(provider, ExecutionProvider::Auto | ExecutionProvider::CoreMl);

        if want_cuda {
            if cuda_available() {
                log::info!("CUDA execution provider enabled");
                providers.push(CUDAExecutionProvider::default().build());
            } else if provider == ExecutionProvider::Cuda {
                log::warn!("CUDA execution provider requested but not available, falling back to CPU");
            }
        }

        if want_coreml {
            if coreml_available() {
                log::info!("CoreML execution provider enabled");
                providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
            } else if provider == ExecutionProvider::CoreMl {
                log::warn!("CoreML execution provider requested but not available, falling back to CPU");
            }
        }

        if providers.is_empty() {
            log::info!("Using CPU execution provider");
        }
        providers
    }

    fn session_builder(config: &RemovalConfig) -> Result<SessionBuilder> {
        let mut builder = Session::builder()
            .map_err(|e| session_error("create session builder", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| session_error("set optimization level", e))?;

        let providers = Self::execution_providers(config.execution_provider);
        if !providers.is_empty() {
            builder = builder
                .with_execution_providers(providers)
                .map_err(|e| session_error("register execution providers", e))?;
        }

        let intra_threads = if config.intra_threads > 0 {
            config.intra_threads
        } else {
            default_parallelism()
        };
        let inter_threads = if config.inter_threads > 0 {
            config.inter_threads
        } else {
            (default_parallelism() / 4).max(1)
        };
        log::debug!("ONNX threading: {intra_threads} intra-op, {inter_threads} inter-op");

        builder
            .with_parallel_execution(true)
            .map_err(|e| session_error("enable parallel execution", e))?
            .with_intra_threads(intra_threads)
            .map_err(|e| session_error("set intra threads", e))?
            .with_inter_threads(inter_threads)
            .map_err(|e| session_error("set inter threads", e))
    }

    /// Load and initialize the ONNX model
    fn load_model(&mut self, config: &RemovalConfig) -> Result<Duration> {
        let model_load_start = Instant::now();
        let model_data = self.model_manager.load_model()?;

        let session = Self::session_builder(config)?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                BgRemovalError::model_error_with_context(
                    "create session for",
                    self.model_manager
                        .model_path()
                        .unwrap_or_else(|| self.model_manager.display_name().into()),
                    &e.to_string(),
                    &["verify the file is a valid ONNX export"],
                )
            })?;

        self.session = Some(session);
        self.model_size_bytes = model_data.len();

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "ONNX model {} loaded in {:.0}ms ({:.2} MB, provider {})",
            self.model_manager.display_name(),
            model_load_time.as_secs_f64() * 1000.0,
            model_data.len() as f64 / (1024.0 * 1024.0),
            config.execution_provider
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, config: &RemovalConfig) -> Result<Option<Duration>> {
        if self.session.is_some() {
            return Ok(None);
        }
        self.load_model(config).map(Some)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BgRemovalError::inference("ONNX session not initialized"))?;

        let inference_start = Instant::now();
        log::debug!("Starting ONNX inference with input shape {:?}", input.dim());

        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert input tensor: {e}"))
        })?;

        // Positional inputs avoid depending on exported tensor names
        let outputs = session.run(ort::inputs![input_value]).map_err(|e| {
            BgRemovalError::inference_error_with_provider(
                "onnx",
                "Model inference",
                &e.to_string(),
                &["retry the request", "use the CPU execution provider"],
            )
        })?;

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| BgRemovalError::inference("No output tensors found"))?;
        let output_tensor = outputs
            .get(first_key)
            .ok_or_else(|| BgRemovalError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| {
                BgRemovalError::inference(format!("Failed to extract output tensor: {e}"))
            })?;

        let output_shape = output_tensor.shape().to_vec();
        let output_array = output_tensor
            .to_owned()
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| {
                BgRemovalError::inference(format!(
                    "Expected 4D output tensor, got {output_shape:?}: {e}"
                ))
            })?;

        log::debug!(
            "ONNX inference complete in {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
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
        self.session.is_some()
    }

    fn backend_name(&self) -> &'static str {
        "onnx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelSpec;
    use tempfile::TempDir;

    #[test]
    fn test_onnx_backend_shapes_follow_contract() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"unused").unwrap();
        let manager = ModelManager::from_spec(
            &ModelSpec::external(&path).with_contract(ModelContract::binary("isnet", 320)),
        )
        .unwrap();

        let backend = OnnxBackend::new(manager);
        assert!(!backend.is_initialized());
        assert_eq!(backend.input_shape(), (1, 3, 320, 320));
        assert_eq!(backend.output_shape(), (1, 1, 320, 320));
        assert_eq!(backend.get_model_info().name, "isnet");
    }

    #[test]
    fn test_zero_byte_model_never_reaches_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.onnx");
        std::fs::write(&path, b"").unwrap();
        let manager = ModelManager::from_spec(&ModelSpec::external(&path)).unwrap();

        let mut backend = OnnxBackend::new(manager);
        let err = backend.initialize(&RemovalConfig::default()).unwrap_err();
        assert!(matches!(err, BgRemovalError::ModelLoad(_)));
        assert!(!backend.is_initialized());
    }

    #[test]
    fn test_infer_before_initialize_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"unused").unwrap();
        let manager = ModelManager::from_spec(&ModelSpec::external(&path)).unwrap();

        let mut backend = OnnxBackend::new(manager);
        let input = Array4::<f32>::zeros((1, 3, 513, 513));
        assert!(matches!(
            backend.infer(&input),
            Err(BgRemovalError::Inference(_))
        ));
    }
}
