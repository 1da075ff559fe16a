use bgremover::{
    CompositeRequest, Compositor, ImageBuffer, ImagePreprocessor, MaskBuilder, MockBackend,
    ModelContract, OutputMode, PipelineController, RemovalConfig, SegmentationEngine,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use tokio::runtime::Runtime;

const SIZES: [(u32, u32); 3] = [(512, 512), (1024, 768), (2048, 2048)];

fn portrait(width: u32, height: u32) -> ImageBuffer {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let (rx, ry) = (width as f32 / 4.0, height as f32 / 3.0);
    ImageBuffer::from_rgba_image(RgbaImage::from_fn(width, height, |x, y| {
        let dx = (x as f32 + 0.5 - cx) / rx;
        let dy = (y as f32 + 0.5 - cy) / ry;
        if dx * dx + dy * dy <= 1.0 {
            Rgba([230, 230, 230, 255])
        } else {
            Rgba([20, 20, 20, 255])
        }
    }))
}

fn controller(contract: ModelContract) -> Arc<PipelineController> {
    let engine = SegmentationEngine::new(
        Box::new(MockBackend::new(contract)),
        RemovalConfig::default(),
    );
    Arc::new(PipelineController::new(Arc::new(engine)))
}

fn benchmark_preprocessing(c: &mut Criterion) {
    let contract = ModelContract::deeplab_v3();
    let letterboxed = ModelContract::binary("letterbox", 320).with_letterbox([255, 255, 255]);

    let mut group = c.benchmark_group("preprocessing");
    for (width, height) in SIZES {
        let image = portrait(width, height);
        group.throughput(Throughput::Elements(u64::from(width) * u64::from(height)));
        group.bench_with_input(
            BenchmarkId::new("stretch_513", format!("{width}x{height}")),
            &image,
            |b, image| {
                b.iter(|| {
                    black_box(ImagePreprocessor::preprocess(image, &contract.preprocessing).unwrap())
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("letterbox_320", format!("{width}x{height}")),
            &image,
            |b, image| {
                b.iter(|| {
                    black_box(
                        ImagePreprocessor::preprocess(image, &letterboxed.preprocessing).unwrap(),
                    )
                });
            },
        );
    }
    group.finish();
}

fn benchmark_mask_and_composite(c: &mut Criterion) {
    let contract = ModelContract::binary("mock", 320);
    let engine = SegmentationEngine::new(
        Box::new(MockBackend::new(contract.clone())),
        RemovalConfig::default(),
    );
    let builder = MaskBuilder::new(&contract);

    let mut group = c.benchmark_group("mask_and_composite");
    group.sample_size(20);
    for (width, height) in SIZES {
        let image = portrait(width, height);
        let input = ImagePreprocessor::preprocess(&image, &contract.preprocessing).unwrap();
        let outcome = engine.segment(&input.tensor).unwrap();
        let label = format!("{width}x{height}");

        for feather in [0, 4] {
            group.bench_function(BenchmarkId::new(format!("mask_feather_{feather}"), &label), |b| {
                b.iter(|| {
                    black_box(
                        builder
                            .build(&outcome.result, None, (width, height), 0.5, feather)
                            .unwrap(),
                    )
                });
            });
        }

        let mask = builder
            .build(&outcome.result, None, (width, height), 0.5, 2)
            .unwrap();
        group.bench_function(BenchmarkId::new("composite_transparent", &label), |b| {
            b.iter(|| black_box(Compositor::composite(&image, &mask, &OutputMode::Transparent).unwrap()));
        });
        group.bench_function(BenchmarkId::new("composite_solid", &label), |b| {
            let mode = OutputMode::SolidColor([0, 255, 0, 255]);
            b.iter(|| black_box(Compositor::composite(&image, &mask, &mode).unwrap()));
        });
    }
    group.finish();
}

fn benchmark_full_pipeline(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let binary = controller(ModelContract::binary("mock", 320));
    let deeplab = controller(ModelContract::deeplab_v3());
    binary.warm_up().unwrap();
    deeplab.warm_up().unwrap();

    let mut group = c.benchmark_group("full_pipeline");
    group.sample_size(10);
    for (name, controller) in [("binary_320", &binary), ("deeplab_513", &deeplab)] {
        for (width, height) in SIZES {
            let image = portrait(width, height);
            group.bench_with_input(
                BenchmarkId::new(name, format!("{width}x{height}")),
                &image,
                |b, image| {
                    let request = CompositeRequest::transparent().with_feather_radius(2);
                    b.iter(|| black_box(controller.process(image.clone(), &request).unwrap()));
                },
            );
        }
    }

    // Concurrent requests share one engine and queue on it
    for concurrency in [1usize, 4] {
        group.bench_with_input(
            BenchmarkId::new("async_concurrent", concurrency),
            &concurrency,
            |b, &concurrency| {
                let image = portrait(512, 512);
                b.iter(|| {
                    rt.block_on(async {
                        let requests = (0..concurrency).map(|_| {
                            binary.process_async(
                                image.clone(),
                                CompositeRequest::transparent(),
                                tokio_util::sync::CancellationToken::new(),
                            )
                        });
                        for result in futures::future::join_all(requests).await {
                            black_box(result.unwrap());
                        }
                    })
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_preprocessing,
    benchmark_mask_and_composite,
    benchmark_full_pipeline
);
criterion_main!(benches);
