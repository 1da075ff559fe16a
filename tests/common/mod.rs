//! Shared helpers for integration tests

#![allow(dead_code)]

use bgremover::{
    ImageBuffer, MockBackend, ModelContract, PipelineController, PixelFormat, RemovalConfig,
    SegmentationEngine,
};
use image::{Rgba, RgbaImage};
use std::sync::Arc;

pub const BRIGHT: u8 = 230;
pub const DARK: u8 = 20;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn controller_with(backend: MockBackend, config: RemovalConfig) -> Arc<PipelineController> {
    Arc::new(PipelineController::new(Arc::new(SegmentationEngine::new(
        Box::new(backend),
        config,
    ))))
}

pub fn binary_controller(size: u32) -> Arc<PipelineController> {
    controller_with(
        MockBackend::new(ModelContract::binary("mock-binary", size)),
        RemovalConfig::default(),
    )
}

pub fn deeplab_controller() -> Arc<PipelineController> {
    controller_with(
        MockBackend::new(ModelContract::deeplab_v3()),
        RemovalConfig::default(),
    )
}

/// Bright ellipse (the "subject") centred on a dark background
pub fn portrait(width: u32, height: u32, rx: f32, ry: f32) -> RgbaImage {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    RgbaImage::from_fn(width, height, |x, y| {
        let dx = (x as f32 + 0.5 - cx) / rx;
        let dy = (y as f32 + 0.5 - cy) / ry;
        let v = if dx * dx + dy * dy <= 1.0 { BRIGHT } else { DARK };
        Rgba([v, v, v, 255])
    })
}

pub fn portrait_buffer(width: u32, height: u32) -> ImageBuffer {
    ImageBuffer::from_rgba_image(portrait(
        width,
        height,
        width as f32 * 0.25,
        height as f32 * 0.35,
    ))
}

pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> ImageBuffer {
    ImageBuffer::new(
        width,
        height,
        PixelFormat::Rgba8,
        rgba.repeat((width * height) as usize),
    )
    .unwrap()
}
