//! Mask-weighted compositing of the original image over a new background
//!
//! All blending happens in `f32` for every channel and is rounded exactly
//! once per channel, so edge pixels never pick up a colour cast from mixed
//! precision.

use crate::{
    config::OutputMode,
    error::{BgRemovalError, Result},
    types::{ImageBuffer, SegmentationMask},
};
use image::{imageops::FilterType, Rgba, RgbaImage};

pub struct Compositor;

impl Compositor {
    /// Apply `mask` to `image` according to `mode`
    ///
    /// # Errors
    /// - `DimensionMismatch` when mask and image sizes differ
    /// - `InvalidInput` when a replacement image is empty
    pub fn composite(
        image: &ImageBuffer,
        mask: &SegmentationMask,
        mode: &OutputMode,
    ) -> Result<RgbaImage> {
        if mask.dimensions() != image.dimensions() {
            return Err(BgRemovalError::dimension_mismatch(format!(
                "Mask {:?} does not match image {:?}",
                mask.dimensions(),
                image.dimensions()
            )));
        }

        let original = image.to_rgba_image();
        match mode {
            OutputMode::Transparent => Ok(Self::apply_alpha(original, mask)),
            OutputMode::SolidColor(color) => {
                let background = Rgba(*color);
                Ok(Self::blend(&original, mask, |_, _| background))
            },
            OutputMode::ReplacementImage(replacement) => {
                replacement.ensure_not_empty()?;
                let (width, height) = image.dimensions();
                let mut background = replacement.to_rgba_image();
                if background.dimensions() != (width, height) {
                    log::debug!(
                        "Resizing replacement background {:?} -> {width}x{height}",
                        background.dimensions()
                    );
                    background =
                        image::imageops::resize(&background, width, height, FilterType::Triangle);
                }
                Ok(Self::blend(&original, mask, |x, y| {
                    *background.get_pixel(x, y)
                }))
            },
        }
    }

    /// Transparent mode: RGB untouched, alpha scaled by the mask
    fn apply_alpha(mut image: RgbaImage, mask: &SegmentationMask) -> RgbaImage {
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let m = mask.value_at(x, y);
            pixel[3] = mix(m, pixel[3], 0);
        }
        image
    }

    /// `out = m * original + (1 - m) * background` on all four channels
    fn blend<F>(original: &RgbaImage, mask: &SegmentationMask, background: F) -> RgbaImage
    where
        F: Fn(u32, u32) -> Rgba<u8>,
    {
        let (width, height) = original.dimensions();
        RgbaImage::from_fn(width, height, |x, y| {
            let m = mask.value_at(x, y);
            let fg = original.get_pixel(x, y);
            let bg = background(x, y);
            Rgba([
                mix(m, fg[0], bg[0]),
                mix(m, fg[1], bg[1]),
                mix(m, fg[2], bg[2]),
                mix(m, fg[3], bg[3]),
            ])
        })
    }
}

/// Linear blend of two 8-bit values by weight `m`, rounded once
fn mix(m: f32, foreground: u8, background: u8) -> u8 {
    let value = m * f32::from(foreground) + (1.0 - m) * f32::from(background);
    value.round().clamp(0.0, 255.0) as u8
}
