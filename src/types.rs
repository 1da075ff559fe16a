//! Core data types flowing through the pipeline

use crate::error::{BgRemovalError, Result};
use crate::processor::PipelineState;
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage, Luma, RgbaImage};
use ndarray::{Array2, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tolerance for the per-pixel "probabilities sum to one" invariant
const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

/// Pixel layouts accepted at the pipeline boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit RGBA, straight alpha
    Rgba8,
    /// 8-bit RGB, implicitly opaque
    Rgb8,
    /// 8-bit BGRA as produced by most platform pixel buffers
    Bgra8,
    /// 8-bit luminance, implicitly opaque
    Gray8,
}

impl PixelFormat {
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Rgb8 => 3,
            Self::Gray8 => 1,
        }
    }

    #[must_use]
    pub fn has_alpha(self) -> bool {
        matches!(self, Self::Rgba8 | Self::Bgra8)
    }
}

/// Decoded pixel data with its dimensions and layout
///
/// Ownership moves from stage to stage; nothing in the pipeline mutates a
/// buffer it does not own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl ImageBuffer {
    /// Wrap raw pixel bytes, checking that the length matches the layout
    ///
    /// # Errors
    /// - `InvalidInput` when `data.len() != width * height * bytes_per_pixel`
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(format.bytes_per_pixel()))
            .ok_or_else(|| BgRemovalError::invalid_input("Image dimensions overflow"))?;

        if data.len() != expected {
            return Err(BgRemovalError::invalid_input(format!(
                "Pixel buffer holds {} bytes, {width}x{height} {format:?} needs {expected}",
                data.len()
            )));
        }

        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    #[must_use]
    pub fn from_rgba_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Rgba8,
            data: image.into_raw(),
        }
    }

    /// Convert a decoded `DynamicImage`, keeping alpha when the source has it
    #[must_use]
    pub fn from_dynamic(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        match image {
            DynamicImage::ImageRgb8(rgb) => Self {
                width,
                height,
                format: PixelFormat::Rgb8,
                data: rgb.into_raw(),
            },
            DynamicImage::ImageLuma8(gray) => Self {
                width,
                height,
                format: PixelFormat::Gray8,
                data: gray.into_raw(),
            },
            other => Self::from_rgba_image(other.into_rgba8()),
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Reject zero-area images before any stage allocates for them
    ///
    /// # Errors
    /// - `InvalidInput` when width or height is zero
    pub fn ensure_not_empty(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(BgRemovalError::invalid_input(format!(
                "Image has zero area ({}x{})",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Expand any supported layout to straight-alpha RGBA
    #[must_use]
    pub fn to_rgba_image(&self) -> RgbaImage {
        let rgba: Vec<u8> = match self.format {
            PixelFormat::Rgba8 => self.data.clone(),
            PixelFormat::Bgra8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0], px[3]])
                .collect(),
            PixelFormat::Rgb8 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[0], px[1], px[2], u8::MAX])
                .collect(),
            PixelFormat::Gray8 => self
                .data
                .iter()
                .flat_map(|&v| [v, v, v, u8::MAX])
                .collect(),
        };

        // Length was validated at construction
        RgbaImage::from_raw(self.width, self.height, rgba)
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    #[must_use]
    pub fn into_dynamic(self) -> DynamicImage {
        DynamicImage::ImageRgba8(self.to_rgba_image())
    }
}

/// How the channels of a `SegmentationResult` should be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    /// Single channel holding the foreground probability
    Binary,
    /// One channel per class; the listed class indices count as foreground
    MultiClass { foreground_classes: Vec<usize> },
}

/// Per-pixel class probabilities at model resolution
#[derive(Debug, Clone)]
pub struct SegmentationResult {
    probabilities: Array4<f32>,
    kind: ResultKind,
}

impl SegmentationResult {
    /// Wrap a probability tensor, enforcing the probability invariants
    ///
    /// # Errors
    /// - `Inference` when the batch is not 1, a binary value leaves [0,1], or a
    ///   multi-class pixel does not sum to 1
    /// - `DimensionMismatch` when a foreground class index has no channel
    pub fn new(probabilities: Array4<f32>, kind: ResultKind) -> Result<Self> {
        let (batch, channels, _, _) = probabilities.dim();
        if batch != 1 {
            return Err(BgRemovalError::inference(format!(
                "Expected batch size 1, model produced {batch}"
            )));
        }

        match &kind {
            ResultKind::Binary => {
                if channels != 1 {
                    return Err(BgRemovalError::dimension_mismatch(format!(
                        "Binary result must have 1 channel, got {channels}"
                    )));
                }
                if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
                    return Err(BgRemovalError::inference(
                        "Foreground probabilities outside [0, 1]",
                    ));
                }
            },
            ResultKind::MultiClass { foreground_classes } => {
                if let Some(&bad) = foreground_classes.iter().find(|&&c| c >= channels) {
                    return Err(BgRemovalError::dimension_mismatch(format!(
                        "Foreground class {bad} not present in {channels}-channel output"
                    )));
                }
                let sums = probabilities.sum_axis(Axis(1));
                if sums
                    .iter()
                    .any(|s| (s - 1.0).abs() > PROBABILITY_SUM_TOLERANCE)
                {
                    return Err(BgRemovalError::inference(
                        "Class probabilities do not sum to 1",
                    ));
                }
            },
        }

        Ok(Self {
            probabilities,
            kind,
        })
    }

    #[must_use]
    pub fn kind(&self) -> &ResultKind {
        &self.kind
    }

    #[must_use]
    pub fn probabilities(&self) -> &Array4<f32> {
        &self.probabilities
    }

    /// Full tensor shape as `(batch, channels, height, width)`
    #[must_use]
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.probabilities.dim()
    }

    /// Spatial resolution as `(height, width)`
    #[must_use]
    pub fn resolution(&self) -> (usize, usize) {
        let (_, _, h, w) = self.probabilities.dim();
        (h, w)
    }

    /// Collapse classes into one foreground probability plane `(height, width)`
    #[must_use]
    pub fn foreground_probability(&self) -> Array2<f32> {
        let (_, _, h, w) = self.probabilities.dim();
        match &self.kind {
            ResultKind::Binary => self
                .probabilities
                .index_axis(Axis(0), 0)
                .index_axis(Axis(0), 0)
                .to_owned(),
            ResultKind::MultiClass { foreground_classes } => {
                let mut plane = Array2::<f32>::zeros((h, w));
                let batch = self.probabilities.index_axis(Axis(0), 0);
                for &class in foreground_classes {
                    plane += &batch.index_axis(Axis(0), class);
                }
                plane.mapv_inplace(|p| p.clamp(0.0, 1.0));
                plane
            },
        }
    }
}

/// Single-channel foreground opacity aligned to the original image
///
/// Values live in [0, 1]. There is no mutable access; masks are derived once
/// and read thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMask {
    data: Vec<f32>,
    dimensions: (u32, u32),
}

impl SegmentationMask {
    /// Create a mask, clamping values into [0, 1]
    ///
    /// # Errors
    /// - `DimensionMismatch` when `data.len() != width * height`
    pub fn new(mut data: Vec<f32>, dimensions: (u32, u32)) -> Result<Self> {
        let expected = dimensions.0 as usize * dimensions.1 as usize;
        if data.len() != expected {
            return Err(BgRemovalError::dimension_mismatch(format!(
                "Mask holds {} values, {}x{} needs {expected}",
                data.len(),
                dimensions.0,
                dimensions.1
            )));
        }
        for v in &mut data {
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        }
        Ok(Self { data, dimensions })
    }

    /// Build a mask from an 8-bit grayscale image (255 = fully foreground)
    #[must_use]
    pub fn from_gray_image(image: &GrayImage) -> Self {
        let data = image.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect();
        Self {
            data,
            dimensions: image.dimensions(),
        }
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.data
    }

    /// Opacity at `(x, y)`; out-of-bounds reads count as background
    #[must_use]
    pub fn value_at(&self, x: u32, y: u32) -> f32 {
        if x >= self.dimensions.0 || y >= self.dimensions.1 {
            return 0.0;
        }
        let index = y as usize * self.dimensions.0 as usize + x as usize;
        self.data.get(index).copied().unwrap_or(0.0)
    }

    /// Quantize to an 8-bit grayscale image
    #[must_use]
    pub fn to_gray_image(&self) -> GrayImage {
        let (width, height) = self.dimensions;
        GrayImage::from_fn(width, height, |x, y| {
            Luma([(self.value_at(x, y) * 255.0).round() as u8])
        })
    }

    /// Get mask statistics
    #[must_use]
    pub fn statistics(&self) -> MaskStatistics {
        let total_pixels = self.data.len();
        let foreground_pixels = self.data.iter().filter(|&&v| v >= 0.5).count();
        let background_pixels = total_pixels - foreground_pixels;
        let ratio = |n: usize| {
            if total_pixels == 0 {
                0.0
            } else {
                n as f32 / total_pixels as f32
            }
        };

        MaskStatistics {
            total_pixels,
            foreground_pixels,
            background_pixels,
            foreground_ratio: ratio(foreground_pixels),
            background_ratio: ratio(background_pixels),
        }
    }

    /// Save mask as PNG
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.to_gray_image()
            .save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }
}

/// Statistics about a segmentation mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub foreground_pixels: usize,
    pub background_pixels: usize,
    pub foreground_ratio: f32,
    pub background_ratio: f32,
}

/// Per-stage wall clock timings in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    pub model_load_ms: u64,
    pub preprocessing_ms: u64,
    pub inference_ms: u64,
    pub mask_ms: u64,
    pub compositing_ms: u64,
    pub total_ms: u64,
}

/// Metadata attached to every pipeline result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub backend: String,
    pub model_name: String,
    pub started_at: DateTime<Utc>,
    pub timings: ProcessingTimings,
    /// Every state the controller passed through, in order
    pub stages: Vec<PipelineState>,
}

impl ProcessingMetadata {
    #[must_use]
    pub fn new(backend: String, model_name: String) -> Self {
        Self {
            backend,
            model_name,
            started_at: Utc::now(),
            timings: ProcessingTimings::default(),
            stages: vec![PipelineState::Idle],
        }
    }
}

/// Output of a successful pipeline run
#[derive(Debug, Clone)]
pub struct RemovalResult {
    /// Composited RGBA output, same dimensions as the input
    pub image: RgbaImage,
    /// The mask used for compositing
    pub mask: SegmentationMask,
    pub original_dimensions: (u32, u32),
    pub metadata: ProcessingMetadata,
}

impl RemovalResult {
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[must_use]
    pub fn timings(&self) -> &ProcessingTimings {
        &self.metadata.timings
    }

    /// Save the result as PNG with alpha channel
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    /// Encode the result as PNG bytes
    pub fn to_png_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buffer);
        self.image.write_to(&mut cursor, image::ImageFormat::Png)?;
        Ok(buffer)
    }

    #[must_use]
    pub fn into_image_buffer(self) -> ImageBuffer {
        ImageBuffer::from_rgba_image(self.image)
    }

    /// Get timing summary for display
    #[must_use]
    pub fn timing_summary(&self) -> String {
        let t = &self.metadata.timings;
        format!(
            "Total: {}ms | Load: {}ms | Preprocess: {}ms | Inference: {}ms | Mask: {}ms | Composite: {}ms",
            t.total_ms, t.model_load_ms, t.preprocessing_ms, t.inference_ms, t.mask_ms, t.compositing_ms
        )
    }
}
