//! Image I/O operations service
//!
//! The codec boundary: everything that turns files or bytes into
//! [`ImageBuffer`]s and back lives here, so the pipeline itself only ever sees
//! decoded pixels.

use crate::{
    error::{BgRemovalError, Result},
    types::ImageBuffer,
};
use image::{
    metadata::Orientation, DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbaImage,
};
use std::io::Cursor;
use std::path::Path;

/// Service for handling image file input/output operations
pub struct ImageIOService;

impl ImageIOService {
    /// Load an image from a file path
    ///
    /// The format is sniffed from the content, so a missing or wrong
    /// extension does not matter. EXIF orientation is applied.
    ///
    /// # Examples
    /// ```rust,no_run
    /// use bgremover::services::ImageIOService;
    ///
    /// let image = ImageIOService::load_image("input.jpg")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<ImageBuffer> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(BgRemovalError::file_io_error(
                "read image file",
                path_ref,
                &std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            ));
        }

        let data = std::fs::read(path_ref)
            .map_err(|e| BgRemovalError::file_io_error("read image data", path_ref, &e))?;
        Self::load_from_bytes(&data)
    }

    /// Decode an encoded image (PNG, JPEG) from memory, upright
    ///
    /// # Errors
    /// - `InvalidInput` for empty or undecodable data
    pub fn load_from_bytes(bytes: &[u8]) -> Result<ImageBuffer> {
        if bytes.is_empty() {
            return Err(BgRemovalError::invalid_input("Image data is empty"));
        }
        let image = Self::decode_upright(bytes).map_err(|e| {
            BgRemovalError::invalid_input(format!("Failed to decode image from bytes: {e}"))
        })?;
        Ok(ImageBuffer::from_dynamic(image))
    }

    /// Decode and apply the EXIF orientation, as phone cameras store it
    fn decode_upright(bytes: &[u8]) -> image::ImageResult<DynamicImage> {
        let mut decoder = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .into_decoder()?;
        let orientation = decoder.orientation().unwrap_or_else(|e| {
            log::debug!("Ignoring unreadable EXIF orientation: {e}");
            Orientation::NoTransforms
        });
        let mut image = DynamicImage::from_decoder(decoder)?;
        if orientation != Orientation::NoTransforms {
            log::debug!("Applying EXIF orientation {orientation:?}");
            image.apply_orientation(orientation);
        }
        Ok(image)
    }

    /// Read everything from an async reader and decode it
    pub async fn load_from_reader<R: tokio::io::AsyncRead + Unpin>(
        mut reader: R,
    ) -> Result<ImageBuffer> {
        use tokio::io::AsyncReadExt;

        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        Self::load_from_bytes(&buffer)
    }

    /// Write `image` as PNG, creating parent directories as needed
    pub fn save_png<P: AsRef<Path>>(image: &RgbaImage, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| BgRemovalError::file_io_error("create output directory", parent, &e))?;
        }
        image.save_with_format(path_ref, ImageFormat::Png)?;
        log::debug!("Saved {}x{} PNG to {}", image.width(), image.height(), path_ref.display());
        Ok(())
    }

    /// Encode `image` as PNG bytes
    pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image.clone()).write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }

    /// Whether the file extension names a format this build can decode
    #[must_use]
    pub fn is_supported_format<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                matches!(
                    ext.to_ascii_lowercase().as_str(),
                    "png" | "jpg" | "jpeg"
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;
    use image::Rgba;
    use tempfile::TempDir;

    fn sample() -> RgbaImage {
        RgbaImage::from_fn(3, 2, |x, y| Rgba([x as u8 * 40, y as u8 * 90, 7, 200]))
    }

    #[test]
    fn test_png_bytes_round_trip_preserves_pixels() {
        let bytes = ImageIOService::encode_png(&sample()).unwrap();
        let decoded = ImageIOService::load_from_bytes(&bytes).unwrap();

        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.format(), PixelFormat::Rgba8);
        assert_eq!(decoded.to_rgba_image(), sample());
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out/result.png");
        ImageIOService::save_png(&sample(), &path).unwrap();

        let loaded = ImageIOService::load_image(&path).unwrap();
        assert_eq!(loaded.dimensions(), (3, 2));
    }

    #[test]
    fn test_wrong_extension_uses_content_detection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actually_png.jpg");
        std::fs::write(&path, ImageIOService::encode_png(&sample()).unwrap()).unwrap();

        let loaded = ImageIOService::load_image(&path).unwrap();
        assert_eq!(loaded.dimensions(), (3, 2));
    }

    #[test]
    fn test_missing_and_garbage_inputs() {
        let err = ImageIOService::load_image("/definitely/not/here.png").unwrap_err();
        assert!(matches!(err, BgRemovalError::Io(_)));

        let err = ImageIOService::load_from_bytes(&[]).unwrap_err();
        assert!(matches!(err, BgRemovalError::InvalidInput(_)));

        let err = ImageIOService::load_from_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, BgRemovalError::InvalidInput(_)));
    }

    /// JPEG with an APP1 Exif segment carrying only the orientation tag
    fn jpeg_with_orientation(image: &RgbaImage, orientation: u16) -> Vec<u8> {
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgba8(image.clone())
            .to_rgb8()
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();

        let mut tiff = b"II*\0".to_vec();
        tiff.extend_from_slice(&8u32.to_le_bytes());
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend_from_slice(&0x0112u16.to_le_bytes());
        tiff.extend_from_slice(&3u16.to_le_bytes());
        tiff.extend_from_slice(&1u32.to_le_bytes());
        tiff.extend_from_slice(&orientation.to_le_bytes());
        tiff.extend_from_slice(&[0, 0]);
        tiff.extend_from_slice(&0u32.to_le_bytes());

        let mut segment = vec![0xFF, 0xE1];
        segment.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
        segment.extend_from_slice(b"Exif\0\0");
        segment.extend_from_slice(&tiff);

        // Right after SOI
        jpeg.splice(2..2, segment);
        jpeg
    }

    #[test]
    fn test_exif_orientation_is_applied() {
        let wide = RgbaImage::from_pixel(8, 4, Rgba([200, 200, 200, 255]));

        let rotated = ImageIOService::load_from_bytes(&jpeg_with_orientation(&wide, 6)).unwrap();
        assert_eq!(rotated.dimensions(), (4, 8));

        let upright = ImageIOService::load_from_bytes(&jpeg_with_orientation(&wide, 1)).unwrap();
        assert_eq!(upright.dimensions(), (8, 4));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("phone.jpg");
        std::fs::write(&path, jpeg_with_orientation(&wide, 6)).unwrap();
        assert_eq!(ImageIOService::load_image(&path).unwrap().dimensions(), (4, 8));

        let engine = crate::inference::SegmentationEngine::new(
            Box::new(crate::backends::MockBackend::new(
                crate::models::ModelContract::binary("mock", 16),
            )),
            crate::config::RemovalConfig::default(),
        );
        let controller = crate::processor::PipelineController::new(std::sync::Arc::new(engine));
        let result = controller
            .process(rotated, &crate::config::CompositeRequest::transparent())
            .unwrap();
        assert_eq!(result.dimensions(), (4, 8));
    }

    #[tokio::test]
    async fn test_load_from_reader() {
        let bytes = ImageIOService::encode_png(&sample()).unwrap();
        let loaded = ImageIOService::load_from_reader(Cursor::new(bytes)).await.unwrap();
        assert_eq!(loaded.dimensions(), (3, 2));
    }

    #[test]
    fn test_supported_formats() {
        assert!(ImageIOService::is_supported_format("a.PNG"));
        assert!(ImageIOService::is_supported_format("b.jpeg"));
        assert!(!ImageIOService::is_supported_format("c.gif"));
        assert!(!ImageIOService::is_supported_format("noext"));
    }
}
