//! Inference backend implementations
//!
//! - ONNX Runtime backend (GPU acceleration via CUDA / `CoreML`)
//! - Tract backend (pure Rust, CPU only)
//! - Mock backend (deterministic, no weights; tests, benches and dry runs)

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

pub mod mock;

pub use self::mock::MockBackend;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackend;

#[cfg(feature = "tract")]
pub use self::tract::TractBackend;
