//! Shared utilities used across pipeline stages

pub mod preprocessing;

pub use preprocessing::{ImagePreprocessor, LetterboxTransform, PreprocessedInput};
