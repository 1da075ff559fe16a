//! End-to-end pipeline properties using the mock backend

mod common;

use bgremover::{
    CompositeRequest, ImageBuffer, MockBackend, ModelContract, OutputKind, OutputMode,
    PipelineState, RemovalConfig,
};
use common::{
    binary_controller, controller_with, deeplab_controller, init_logging, portrait,
    portrait_buffer, solid, BRIGHT, DARK,
};
use image::Rgba;

#[test]
fn test_processing_is_deterministic() {
    init_logging();
    let controller = binary_controller(64);
    let request = CompositeRequest::transparent().with_feather_radius(2);

    let first = controller.process(portrait_buffer(96, 80), &request).unwrap();
    let second = controller.process(portrait_buffer(96, 80), &request).unwrap();

    assert_eq!(first.image, second.image);
    assert_eq!(first.mask, second.mask);
}

#[test]
fn test_output_matches_input_dimensions() {
    let controller = binary_controller(32);
    for (width, height) in [(1, 1), (7, 3), (3, 7), (300, 200), (33, 129)] {
        let result = controller
            .process(portrait_buffer(width, height), &CompositeRequest::transparent())
            .unwrap();
        assert_eq!(result.dimensions(), (width, height));
        assert_eq!(result.mask.dimensions(), (width, height));
        assert_eq!(result.original_dimensions, (width, height));
    }
}

#[test]
fn test_alpha_is_monotonic_in_mask() {
    let controller = binary_controller(48);
    let result = controller
        .process(
            portrait_buffer(120, 90),
            &CompositeRequest::transparent().with_feather_radius(4),
        )
        .unwrap();

    let mut pairs: Vec<(f32, u8)> = result
        .image
        .enumerate_pixels()
        .map(|(x, y, p)| (result.mask.value_at(x, y), p[3]))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    for window in pairs.windows(2) {
        assert!(
            window[0].1 <= window[1].1,
            "mask {} -> alpha {} but mask {} -> alpha {}",
            window[0].0,
            window[0].1,
            window[1].0,
            window[1].1
        );
    }
}

#[test]
fn test_zero_feather_is_hard_threshold() {
    let controller = binary_controller(64);
    let result = controller
        .process(portrait_buffer(128, 128), &CompositeRequest::transparent())
        .unwrap();

    assert!(result.mask.values().iter().all(|&v| v == 0.0 || v == 1.0));
    assert!(result.image.pixels().all(|p| p[3] == 0 || p[3] == 255));
}

#[test]
fn test_feather_radius_never_changes_dimensions() {
    let controller = binary_controller(32);
    for radius in [0, 1, 3, 8, 40] {
        let result = controller
            .process(
                portrait_buffer(70, 50),
                &CompositeRequest::transparent().with_feather_radius(radius),
            )
            .unwrap();
        assert_eq!(result.dimensions(), (70, 50), "radius {radius}");
        assert!(result.mask.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }
}

#[test]
fn test_portrait_scenario_with_default_model() {
    init_logging();
    let controller = deeplab_controller();
    let (rx, ry) = (120.0, 180.0);
    let image = ImageBuffer::from_rgba_image(portrait(512, 512, rx, ry));

    let result = controller
        .process(image, &CompositeRequest::transparent())
        .unwrap();

    assert_eq!(result.dimensions(), (512, 512));
    assert_eq!(result.image.get_pixel(256, 256), &Rgba([BRIGHT, BRIGHT, BRIGHT, 255]));
    for (x, y) in [(0, 0), (511, 0), (0, 511), (511, 511)] {
        assert_eq!(result.image.get_pixel(x, y)[3], 0, "corner ({x}, {y})");
    }

    let expected_ratio = std::f32::consts::PI * rx * ry / (512.0 * 512.0);
    let stats = result.mask.statistics();
    assert!(
        (stats.foreground_ratio - expected_ratio).abs() < 0.03,
        "foreground ratio {} vs ellipse {}",
        stats.foreground_ratio,
        expected_ratio
    );

    assert_eq!(result.metadata.model_name, "deeplabv3");
    assert_eq!(result.metadata.stages.last(), Some(&PipelineState::Done));
}

#[test]
fn test_all_black_image_completes() {
    let controller = deeplab_controller();
    let result = controller
        .process(solid(4, 4, [0, 0, 0, 255]), &CompositeRequest::transparent())
        .unwrap();

    assert_eq!(result.dimensions(), (4, 4));
    assert!(result.mask.values().iter().all(|&v| v == 0.0));
    assert!(result.image.pixels().all(|p| p[3] == 0));
}

#[test]
fn test_solid_color_background() {
    let controller = binary_controller(64);
    let result = controller
        .process(
            portrait_buffer(100, 100),
            &CompositeRequest::solid_color([0, 255, 0, 255]),
        )
        .unwrap();

    assert_eq!(result.image.get_pixel(0, 0), &Rgba([0, 255, 0, 255]));
    assert_eq!(result.image.get_pixel(50, 50), &Rgba([BRIGHT, BRIGHT, BRIGHT, 255]));
}

#[test]
fn test_replacement_image_background() {
    let controller = binary_controller(64);
    let backdrop = solid(10, 10, [200, 10, 10, 255]);
    let result = controller
        .process(
            portrait_buffer(80, 60),
            &CompositeRequest::replacement_image(backdrop),
        )
        .unwrap();

    assert_eq!(result.dimensions(), (80, 60));
    assert_eq!(result.image.get_pixel(1, 1), &Rgba([200, 10, 10, 255]));
    assert_eq!(result.image.get_pixel(40, 30)[0], BRIGHT);
    assert!(matches!(
        CompositeRequest::replacement_image(solid(1, 1, [0; 4])).mode,
        OutputMode::ReplacementImage(_)
    ));
}

#[test]
fn test_letterboxed_model_ignores_padding() {
    let contract = ModelContract::binary("letterbox", 64).with_letterbox([255, 255, 255]);
    let controller = controller_with(MockBackend::new(contract), RemovalConfig::default());

    // Wide image: white padding above and below would read as foreground
    let image = ImageBuffer::from_rgba_image(image::RgbaImage::from_fn(160, 40, |x, _| {
        let v = if x < 80 { BRIGHT } else { DARK };
        Rgba([v, v, v, 255])
    }));
    let result = controller
        .process(image, &CompositeRequest::transparent())
        .unwrap();

    assert_eq!(result.dimensions(), (160, 40));
    assert_eq!(result.image.get_pixel(150, 0)[3], 0);
    assert_eq!(result.image.get_pixel(150, 39)[3], 0);
    assert_eq!(result.image.get_pixel(10, 20)[3], 255);
}

#[test]
fn test_class_label_and_logit_models() {
    let labels = ModelContract {
        name: "labels".into(),
        output_kind: OutputKind::ClassLabels { num_classes: 21 },
        foreground_classes: vec![15],
        ..ModelContract::binary("labels", 32)
    };
    let logits = ModelContract {
        name: "logits".into(),
        output_kind: OutputKind::Logits,
        ..ModelContract::binary("logits", 32)
    };

    for contract in [labels, logits] {
        let name = contract.name.clone();
        let controller = controller_with(MockBackend::new(contract), RemovalConfig::default());
        let result = controller
            .process(portrait_buffer(64, 64), &CompositeRequest::transparent())
            .unwrap();
        assert_eq!(result.image.get_pixel(32, 32)[3], 255, "{name}");
        assert_eq!(result.image.get_pixel(0, 0)[3], 0, "{name}");
    }
}

#[test]
fn test_timings_and_stage_history() {
    let controller = binary_controller(32);
    let result = controller
        .process(portrait_buffer(64, 64), &CompositeRequest::transparent())
        .unwrap();

    assert_eq!(
        result.metadata.stages,
        vec![
            PipelineState::Idle,
            PipelineState::Preprocessing,
            PipelineState::Inferring,
            PipelineState::BuildingMask,
            PipelineState::Compositing,
            PipelineState::Done,
        ]
    );
    let timings = result.timings();
    assert!(timings.total_ms >= timings.inference_ms);
    assert!(result.timing_summary().starts_with("Total:"));
}
