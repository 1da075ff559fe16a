//! Image to tensor preprocessing
//!
//! Resizes an [`ImageBuffer`] to the model's fixed input resolution and
//! normalizes it into an NCHW tensor. Stretching is the default; models that
//! need the aspect ratio preserved get a symmetric letterbox and a
//! [`LetterboxTransform`] describing where the content landed.

use crate::{
    error::{BgRemovalError, Result},
    models::PreprocessingConfig,
    types::ImageBuffer,
};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use ndarray::Array4;

/// Placement of the resized content inside the letterboxed canvas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    pub offset_x: u32,
    pub offset_y: u32,
    pub content_width: u32,
    pub content_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl LetterboxTransform {
    /// Content rectangle `(x, y, width, height)` rescaled to a map of
    /// `map_width x map_height` (the model output may differ from its input)
    #[must_use]
    pub fn content_region(&self, map_width: u32, map_height: u32) -> (u32, u32, u32, u32) {
        let sx = f64::from(map_width) / f64::from(self.canvas_width);
        let sy = f64::from(map_height) / f64::from(self.canvas_height);

        let x = ((f64::from(self.offset_x) * sx).round() as u32).min(map_width.saturating_sub(1));
        let y = ((f64::from(self.offset_y) * sy).round() as u32).min(map_height.saturating_sub(1));
        let width = ((f64::from(self.content_width) * sx).round() as u32)
            .clamp(1, map_width - x);
        let height = ((f64::from(self.content_height) * sy).round() as u32)
            .clamp(1, map_height - y);

        (x, y, width, height)
    }
}

/// Tensor plus the bookkeeping needed to map the model output back
#[derive(Debug, Clone)]
pub struct PreprocessedInput {
    pub tensor: Array4<f32>,
    /// `(width, height)` of the source image
    pub original_dimensions: (u32, u32),
    /// Present only when the image was letterboxed
    pub letterbox: Option<LetterboxTransform>,
}

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Preprocess image for model inference
    ///
    /// # Errors
    /// - `InvalidInput` for zero-sized images
    /// - `InvalidConfig` for a zero target size
    pub fn preprocess(
        image: &ImageBuffer,
        preprocessing_config: &PreprocessingConfig,
    ) -> Result<PreprocessedInput> {
        image.ensure_not_empty()?;
        let [target_width, target_height] = preprocessing_config.target_size;
        if target_width == 0 || target_height == 0 {
            return Err(BgRemovalError::invalid_config(format!(
                "Model input size must be non-zero, got {target_width}x{target_height}"
            )));
        }

        let rgb_image = DynamicImage::ImageRgba8(image.to_rgba_image()).to_rgb8();
        let original_dimensions = rgb_image.dimensions();

        let (canvas, letterbox) = if preprocessing_config.letterbox {
            let (canvas, transform) = Self::letterbox(
                &rgb_image,
                target_width,
                target_height,
                preprocessing_config.padding_color,
            );
            (canvas, Some(transform))
        } else {
            let canvas = image::imageops::resize(
                &rgb_image,
                target_width,
                target_height,
                FilterType::Triangle,
            );
            (canvas, None)
        };

        Ok(PreprocessedInput {
            tensor: Self::canvas_to_tensor(&canvas, preprocessing_config),
            original_dimensions,
            letterbox,
        })
    }

    /// Aspect-preserving resize centered on a padded canvas
    fn letterbox(
        rgb_image: &RgbImage,
        target_width: u32,
        target_height: u32,
        padding: [u8; 3],
    ) -> (RgbImage, LetterboxTransform) {
        let (orig_width, orig_height) = rgb_image.dimensions();
        let scale = (f64::from(target_width) / f64::from(orig_width))
            .min(f64::from(target_height) / f64::from(orig_height));

        let new_width = ((f64::from(orig_width) * scale).round() as u32).clamp(1, target_width);
        let new_height = ((f64::from(orig_height) * scale).round() as u32).clamp(1, target_height);

        let resized =
            image::imageops::resize(rgb_image, new_width, new_height, FilterType::Triangle);

        let mut canvas = RgbImage::from_pixel(target_width, target_height, Rgb(padding));
        let offset_x = (target_width - new_width) / 2;
        let offset_y = (target_height - new_height) / 2;
        image::imageops::replace(&mut canvas, &resized, i64::from(offset_x), i64::from(offset_y));

        let transform = LetterboxTransform {
            offset_x,
            offset_y,
            content_width: new_width,
            content_height: new_height,
            canvas_width: target_width,
            canvas_height: target_height,
        };
        (canvas, transform)
    }

    /// Convert canvas to normalized tensor
    fn canvas_to_tensor(canvas: &RgbImage, preprocessing_config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = canvas.dimensions();
        let mean = preprocessing_config.normalization_mean;
        let std = preprocessing_config.normalization_std;

        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match canvas size
        for (x, y, pixel) in canvas.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (f32::from(pixel[c]) / 255.0 - mean[c]) / std[c];
            }
        }

        tensor
    }
}
