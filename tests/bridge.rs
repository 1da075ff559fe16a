//! Typed and legacy bridge adapters over the mock pipeline

mod common;

use bgremover::{
    BackgroundMode, BackgroundRemover, ErrorKind, ImageIOService, ImageSource, LegacyBridge,
    OutputPayload, OutputTarget, RemoveBackgroundOptions, TypedBridge,
};
use common::{binary_controller, portrait, BRIGHT};
use image::{GenericImageView, Rgba};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    input: PathBuf,
    output_dir: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("portrait.jpg");
    // PNG content behind a .jpg name, decoded by content
    std::fs::write(
        &input,
        ImageIOService::encode_png(&portrait(64, 48, 16.0, 18.0)).unwrap(),
    )
    .unwrap();
    let output_dir = dir.path().join("out");
    Fixture {
        _dir: dir,
        input,
        output_dir,
    }
}

fn typed_bridge(fixture: &Fixture) -> TypedBridge {
    TypedBridge::new(binary_controller(32)).with_output_dir(&fixture.output_dir)
}

#[tokio::test]
async fn test_typed_bridge_writes_png_named_after_input() {
    let fixture = fixture();
    let bridge = typed_bridge(&fixture);

    let output = bridge
        .remove_background(
            ImageSource::Path(fixture.input.clone()),
            RemoveBackgroundOptions::default(),
        )
        .await
        .unwrap();

    let expected = fixture.output_dir.join("portrait.jpg.png");
    assert!(matches!(&output.payload, OutputPayload::File(path) if *path == expected));
    assert_eq!(
        output.file_uri(),
        Some(format!("file://{}", expected.display()))
    );

    let written = image::open(&expected).unwrap().to_rgba8();
    assert_eq!(written.dimensions(), (64, 48));
    assert_eq!(written.get_pixel(0, 0)[3], 0);
    assert_eq!(written.get_pixel(32, 24), &Rgba([BRIGHT, BRIGHT, BRIGHT, 255]));
    assert_eq!(output.metadata.backend, "mock");
}

#[tokio::test]
async fn test_typed_bridge_in_memory_outputs() {
    let fixture = fixture();
    let bridge = typed_bridge(&fixture);
    let bytes = std::fs::read(&fixture.input).unwrap();

    let output = bridge
        .remove_background(
            ImageSource::Bytes(bytes.clone()),
            RemoveBackgroundOptions {
                output: OutputTarget::Bytes,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let OutputPayload::Bytes(png) = output.payload else {
        panic!("expected bytes payload");
    };
    assert_eq!(ImageIOService::load_from_bytes(&png).unwrap().dimensions(), (64, 48));

    let output = bridge
        .remove_background(
            ImageSource::Bytes(bytes),
            RemoveBackgroundOptions {
                mode: BackgroundMode::SolidColor,
                color: Some("#0000ff".into()),
                output: OutputTarget::Decoded,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let OutputPayload::Decoded(decoded) = output.payload else {
        panic!("expected decoded payload");
    };
    assert_eq!(decoded.to_rgba_image().get_pixel(0, 0), &Rgba([0, 0, 255, 255]));
    assert!(!fixture.output_dir.exists());
}

#[tokio::test]
async fn test_typed_bridge_replacement_image_from_uri() {
    let fixture = fixture();
    let backdrop = fixture.output_dir.with_file_name("backdrop.png");
    ImageIOService::save_png(
        &image::RgbaImage::from_pixel(4, 4, Rgba([9, 99, 199, 255])),
        &backdrop,
    )
    .unwrap();

    let output = typed_bridge(&fixture)
        .remove_background(
            ImageSource::Uri(format!("file://{}", fixture.input.display())),
            RemoveBackgroundOptions {
                mode: BackgroundMode::ReplacementImage,
                replacement_image: Some(format!("file://{}", backdrop.display())),
                output: OutputTarget::Decoded,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let OutputPayload::Decoded(decoded) = output.payload else {
        panic!("expected decoded payload");
    };
    assert_eq!(decoded.to_rgba_image().get_pixel(63, 47), &Rgba([9, 99, 199, 255]));
}

#[tokio::test]
async fn test_typed_bridge_structured_errors() {
    let fixture = fixture();
    let bridge = typed_bridge(&fixture);

    let err = bridge
        .remove_background(
            ImageSource::Path(fixture.input.with_file_name("missing.png")),
            RemoveBackgroundOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::IoError);
    assert!(!err.retryable);

    let err = bridge
        .remove_background(
            ImageSource::Uri("https://example.com/cat.png".into()),
            RemoveBackgroundOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInputError);

    let err = bridge
        .remove_background(
            ImageSource::Path(fixture.input.clone()),
            RemoveBackgroundOptions {
                threshold: Some(-1.0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidConfigError);
}

#[tokio::test]
async fn test_host_mode_names_run_end_to_end() {
    let fixture = fixture();
    let backdrop = fixture.output_dir.with_file_name("backdrop.png");
    ImageIOService::save_png(
        &image::RgbaImage::from_pixel(4, 4, Rgba([9, 99, 199, 255])),
        &backdrop,
    )
    .unwrap();
    let bridge = typed_bridge(&fixture);

    let cases = [
        (
            json!({ "mode": "solidColor", "color": "#ff0000", "output": "decoded" }),
            BackgroundMode::SolidColor,
            Rgba([255, 0, 0, 255]),
        ),
        (
            json!({
                "mode": "replacementImage",
                "replacementImage": backdrop.display().to_string(),
                "output": "decoded"
            }),
            BackgroundMode::ReplacementImage,
            Rgba([9, 99, 199, 255]),
        ),
    ];

    for (json, mode, corner) in cases {
        let options: RemoveBackgroundOptions = serde_json::from_value(json).unwrap();
        assert_eq!(options.mode, mode);

        let output = bridge
            .remove_background(ImageSource::Path(fixture.input.clone()), options)
            .await
            .unwrap();
        let OutputPayload::Decoded(decoded) = output.payload else {
            panic!("expected decoded payload");
        };
        let pixels = decoded.to_rgba_image();
        assert_eq!(pixels.get_pixel(0, 0), &corner, "{mode:?}");
        assert_eq!(pixels.get_pixel(32, 24), &Rgba([BRIGHT, BRIGHT, BRIGHT, 255]));
    }
}

#[tokio::test]
async fn test_in_memory_sources_get_distinct_output_files() {
    let fixture = fixture();
    let bridge = typed_bridge(&fixture);
    let wide = ImageIOService::encode_png(&portrait(40, 20, 10.0, 6.0)).unwrap();
    let tall = ImageIOService::encode_png(&portrait(20, 40, 6.0, 10.0)).unwrap();

    let (first, second) = tokio::join!(
        bridge.remove_background(ImageSource::Bytes(wide), RemoveBackgroundOptions::default()),
        bridge.remove_background(ImageSource::Bytes(tall), RemoveBackgroundOptions::default()),
    );
    let (OutputPayload::File(first), OutputPayload::File(second)) =
        (first.unwrap().payload, second.unwrap().payload)
    else {
        panic!("expected file payloads");
    };

    assert_ne!(first, second);
    for path in [&first, &second] {
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("image-") && name.ends_with(".png"), "{name}");
    }
    assert_eq!(image::open(&first).unwrap().dimensions(), (40, 20));
    assert_eq!(image::open(&second).unwrap().dimensions(), (20, 40));
}

#[tokio::test]
async fn test_file_uris_with_spaces_and_non_ascii_names() {
    let fixture = fixture();
    let dir = fixture.input.parent().unwrap().join("my photos");
    std::fs::create_dir_all(&dir).unwrap();
    let input = dir.join("café portrait.png");
    std::fs::copy(&fixture.input, &input).unwrap();
    let bridge = LegacyBridge::new(typed_bridge(&fixture));

    let encoded = url::Url::from_file_path(&input).unwrap().to_string();
    assert!(encoded.contains("my%20photos/caf%C3%A9%20portrait.png"));

    let outcome = call_legacy(&bridge, encoded, json!({})).await;
    let uri = outcome.lock().unwrap().clone().unwrap().unwrap();
    assert!(uri.ends_with("/caf%C3%A9%20portrait.png.png"), "{uri}");

    let written = url::Url::parse(&uri).unwrap().to_file_path().unwrap();
    assert_eq!(written, fixture.output_dir.join("café portrait.png.png"));
    assert_eq!(image::open(&written).unwrap().dimensions(), (64, 48));
}

type Outcome = Arc<Mutex<Option<Result<String, (String, String)>>>>;

async fn call_legacy(bridge: &LegacyBridge, uri: String, options: serde_json::Value) -> Outcome {
    let outcome: Outcome = Arc::new(Mutex::new(None));
    let resolved = Arc::clone(&outcome);
    let rejected = Arc::clone(&outcome);
    bridge
        .remove_background(
            uri,
            options,
            move |value| *resolved.lock().unwrap() = Some(Ok(value)),
            move |code, message| *rejected.lock().unwrap() = Some(Err((code, message))),
        )
        .await;
    outcome
}

#[tokio::test]
async fn test_legacy_bridge_resolves_with_file_uri() {
    let fixture = fixture();
    let bridge = LegacyBridge::new(typed_bridge(&fixture));

    let outcome = call_legacy(
        &bridge,
        format!("file://{}", fixture.input.display()),
        json!({ "featherRadius": 2, "output": "bytes" }),
    )
    .await;

    let uri = outcome.lock().unwrap().clone().unwrap().unwrap();
    assert!(uri.starts_with("file://"));
    assert!(uri.ends_with("portrait.jpg.png"));
    assert!(fixture.output_dir.join("portrait.jpg.png").is_file());
}

#[tokio::test]
async fn test_legacy_bridge_null_options_mean_defaults() {
    let fixture = fixture();
    let bridge = LegacyBridge::new(typed_bridge(&fixture));

    let outcome = call_legacy(
        &bridge,
        fixture.input.display().to_string(),
        serde_json::Value::Null,
    )
    .await;
    assert!(matches!(outcome.lock().unwrap().as_ref(), Some(Ok(_))));
}

#[tokio::test]
async fn test_legacy_bridge_rejects_with_error_kind() {
    let fixture = fixture();
    let bridge = LegacyBridge::new(typed_bridge(&fixture));

    let outcome = call_legacy(
        &bridge,
        format!("file://{}", fixture.input.display()),
        json!({ "threshold": "high" }),
    )
    .await;
    let (code, message) = outcome.lock().unwrap().clone().unwrap().unwrap_err();
    assert_eq!(code, "InvalidConfigError");
    assert!(message.contains("Malformed options"));

    let outcome = call_legacy(
        &bridge,
        "file:///definitely/missing.png".into(),
        json!({}),
    )
    .await;
    let (code, _) = outcome.lock().unwrap().clone().unwrap().unwrap_err();
    assert_eq!(code, "IoError");
}
