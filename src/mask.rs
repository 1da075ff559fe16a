//! Segmentation result to original-resolution mask

use crate::{
    config::{validate_feather_radius, MAX_FEATHER_RADIUS},
    error::{BgRemovalError, Result},
    models::ModelContract,
    types::{SegmentationMask, SegmentationResult},
    utils::LetterboxTransform,
};
use image::{imageops::FilterType, GrayImage, Luma};
use imageproc::{distance_transform::Norm, filter::gaussian_blur_f32, morphology::close};
use log::debug;

/// Single-channel float map used while resampling probabilities
type ProbabilityMap = image::ImageBuffer<Luma<f32>, Vec<f32>>;

/// Builds masks for one model contract
#[derive(Debug, Clone)]
pub struct MaskBuilder {
    expected_shape: (usize, usize, usize, usize),
}

impl MaskBuilder {
    #[must_use]
    pub fn new(contract: &ModelContract) -> Self {
        let (n, _, h, w) = contract.output_shape;
        Self {
            expected_shape: (n, contract.num_classes(), h, w),
        }
    }

    /// Turn model-resolution probabilities into a mask at `original_dimensions`
    ///
    /// Pixels with foreground probability `>= threshold` are foreground. With
    /// `feather_radius == 0` the mask is exactly 0 or 1; otherwise the hard mask
    /// is closed with an L-infinity structuring element of that radius and
    /// blurred with sigma `radius / 2`.
    ///
    /// # Errors
    /// - `DimensionMismatch` when the result shape differs from the contract
    /// - `InvalidInput` for a zero-sized target
    /// - `InvalidConfig` for a threshold outside [0, 1] or a radius above
    ///   [`MAX_FEATHER_RADIUS`]
    pub fn build(
        &self,
        result: &SegmentationResult,
        letterbox: Option<&LetterboxTransform>,
        original_dimensions: (u32, u32),
        threshold: f32,
        feather_radius: u32,
    ) -> Result<SegmentationMask> {
        if result.shape() != self.expected_shape {
            return Err(BgRemovalError::dimension_mismatch(format!(
                "Segmentation result {:?} incompatible with model contract {:?}",
                result.shape(),
                self.expected_shape
            )));
        }
        let (width, height) = original_dimensions;
        if width == 0 || height == 0 {
            return Err(BgRemovalError::invalid_input(format!(
                "Cannot build a mask for a {width}x{height} image"
            )));
        }
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(BgRemovalError::config_value_error(
                "threshold",
                threshold,
                "0.0-1.0",
                Some(0.5),
            ));
        }

        validate_feather_radius("feather radius", feather_radius)?;

        let probabilities = Self::upsample(result, letterbox, width, height)?;
        let hard = GrayImage::from_fn(width, height, |x, y| {
            if probabilities.get_pixel(x, y)[0] >= threshold {
                Luma([u8::MAX])
            } else {
                Luma([0])
            }
        });

        let smoothed = if feather_radius == 0 {
            hard
        } else {
            let k = u8::try_from(feather_radius).map_err(|_| {
                BgRemovalError::invalid_config(format!("feather radius {feather_radius} too large"))
            })?;
            let sigma = f32::from(k) / 2.0;
            debug!("Feathering mask: close radius {k}, blur sigma {sigma}");
            gaussian_blur_f32(&close(&hard, Norm::LInf, k), sigma)
        };

        Ok(SegmentationMask::from_gray_image(&smoothed))
    }

    /// Foreground plane cropped to the letterbox content and resized bilinearly
    fn upsample(
        result: &SegmentationResult,
        letterbox: Option<&LetterboxTransform>,
        width: u32,
        height: u32,
    ) -> Result<ProbabilityMap> {
        let plane = result.foreground_probability();
        let (map_h, map_w) = plane.dim();
        let (map_w, map_h) = (
            u32::try_from(map_w).map_err(|_| BgRemovalError::dimension_mismatch("Map too wide"))?,
            u32::try_from(map_h).map_err(|_| BgRemovalError::dimension_mismatch("Map too tall"))?,
        );

        let values: Vec<f32> = plane.iter().copied().collect();
        let map = ProbabilityMap::from_raw(map_w, map_h, values).ok_or_else(|| {
            BgRemovalError::dimension_mismatch("Probability plane does not fill its map")
        })?;

        let content = match letterbox {
            Some(transform) => {
                let (x, y, w, h) = transform.content_region(map_w, map_h);
                image::imageops::crop_imm(&map, x, y, w, h).to_image()
            },
            None => map,
        };

        if content.dimensions() == (width, height) {
            return Ok(content);
        }
        Ok(image::imageops::resize(
            &content,
            width,
            height,
            FilterType::Triangle,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultKind;
    use ndarray::Array4;

    fn binary_result(size: usize, f: impl Fn(usize, usize) -> f32) -> SegmentationResult {
        let data = Array4::from_shape_fn((1, 1, size, size), |(_, _, y, x)| f(y, x));
        SegmentationResult::new(data, ResultKind::Binary).unwrap()
    }

    fn builder(size: u32) -> MaskBuilder {
        MaskBuilder::new(&ModelContract::binary("test", size))
    }

    #[test]
    fn test_hard_mask_without_feathering() {
        let result = binary_result(16, |_, x| if x < 8 { 0.9 } else { 0.1 });
        let mask = builder(16).build(&result, None, (32, 32), 0.5, 0).unwrap();

        assert_eq!(mask.dimensions(), (32, 32));
        assert!(mask.values().iter().all(|&v| v == 0.0 || v == 1.0));
        assert_eq!(mask.value_at(0, 0), 1.0);
        assert_eq!(mask.value_at(31, 31), 0.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let result = binary_result(4, |_, _| 0.5);
        let mask = builder(4).build(&result, None, (4, 4), 0.5, 0).unwrap();
        assert!(mask.values().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_feathering_softens_edges_only() {
        let result = binary_result(64, |_, x| if x < 32 { 1.0 } else { 0.0 });
        let hard = builder(64).build(&result, None, (64, 64), 0.5, 0).unwrap();
        let soft = builder(64).build(&result, None, (64, 64), 0.5, 4).unwrap();

        assert_eq!(soft.dimensions(), hard.dimensions());
        assert!(soft.values().iter().any(|&v| v > 0.0 && v < 1.0));
        assert!(soft.value_at(2, 32) > 0.99);
        assert!(soft.value_at(61, 32) < 0.01);
    }

    #[test]
    fn test_letterbox_padding_is_excluded() {
        // rows 0..4 and 12..16 are padding the model wrongly called foreground
        let result = binary_result(16, |y, _| if (4..12).contains(&y) { 0.0 } else { 1.0 });
        let transform = LetterboxTransform {
            offset_x: 0,
            offset_y: 4,
            content_width: 16,
            content_height: 8,
            canvas_width: 16,
            canvas_height: 16,
        };

        let mask = builder(16)
            .build(&result, Some(&transform), (32, 16), 0.5, 0)
            .unwrap();
        assert_eq!(mask.dimensions(), (32, 16));
        assert!(mask.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_result_shape_mismatch() {
        let result = binary_result(8, |_, _| 1.0);
        let err = builder(16).build(&result, None, (8, 8), 0.5, 0).unwrap_err();
        assert!(matches!(err, BgRemovalError::DimensionMismatch(_)));
    }

    #[test]
    fn test_multiclass_foreground_sum() {
        let contract = ModelContract {
            output_shape: (1, 3, 4, 4),
            output_kind: crate::models::OutputKind::Probabilities,
            foreground_classes: vec![1, 2],
            ..ModelContract::binary("three-class", 4)
        };
        let data = Array4::from_shape_fn((1, 3, 4, 4), |(_, c, _, _)| match c {
            0 => 0.4,
            _ => 0.3,
        });
        let result = SegmentationResult::new(
            data,
            ResultKind::MultiClass {
                foreground_classes: vec![1, 2],
            },
        )
        .unwrap();

        let mask = MaskBuilder::new(&contract)
            .build(&result, None, (4, 4), 0.55, 0)
            .unwrap();
        assert!(mask.values().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_feather_radius_above_limit_is_rejected() {
        let result = binary_result(4, |_, _| 1.0);
        assert!(builder(4)
            .build(&result, None, (4, 4), 0.5, MAX_FEATHER_RADIUS)
            .is_ok());
        assert!(matches!(
            builder(4).build(&result, None, (4, 4), 0.5, MAX_FEATHER_RADIUS + 1),
            Err(BgRemovalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_threshold() {
        let result = binary_result(4, |_, _| 1.0);
        assert!(matches!(
            builder(4).build(&result, None, (4, 4), 1.5, 0),
            Err(BgRemovalError::InvalidConfig(_))
        ));
    }
}
