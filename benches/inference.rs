//! Benchmarks for request inference and buffer pooling
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use feature_pipe::buffer::{
    standalone_image, BufferPool, ImageAllocator, ImageFormat, ImageSize, ImageSpec,
};
use feature_pipe::capture::{
    standard_stages, CaptureFeaturePipe, CaptureFeatureRequest, FeatureId, NodeSet, RequestCallback,
    RequestPtr, TypeId,
};
use feature_pipe::config::PipeConfig;
use std::sync::Arc;
use std::time::Duration;

const SENSOR: ImageSize = ImageSize::new(64, 48);

struct Ignore;

impl RequestCallback for Ignore {
    fn on_completed(&self, _request: &RequestPtr, _ok: bool) {}
    fn on_aborted(&self, _request: &RequestPtr) {}
}

fn request(features: &[FeatureId]) -> CaptureFeatureRequest {
    let mut request = CaptureFeatureRequest::new(0, 0);
    for feature in features {
        request.add_feature(*feature);
    }
    let raw = standalone_image(ImageSpec::new(SENSOR, ImageFormat::Bayer10)).unwrap();
    let jpeg = standalone_image(ImageSpec::new(SENSOR, ImageFormat::Jpeg)).unwrap();
    request.add_source_buffer(TypeId::MainFullRaw, raw).unwrap();
    request.add_target_buffer(TypeId::Jpeg, jpeg).unwrap();
    request
}

fn bench_evaluate(c: &mut Criterion) {
    let pipe = CaptureFeaturePipe::new(PipeConfig::default(), Arc::new(Ignore)).unwrap();
    for (id, stage) in standard_stages(Duration::ZERO) {
        pipe.add_node(id, stage).unwrap();
    }

    let cases: [(&str, &[FeatureId]); 4] = [
        ("plain", &[]),
        ("mfnr", &[FeatureId::Mfnr]),
        ("fb", &[FeatureId::Fb]),
        ("all", &[FeatureId::Remosaic, FeatureId::Mfnr, FeatureId::Fb]),
    ];

    let mut group = c.benchmark_group("evaluate");
    for (name, features) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &features, |b, features| {
            b.iter_batched(
                || request(features),
                |mut request| {
                    pipe.evaluate(&mut request).unwrap();
                    black_box(request.nodes())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_node_sets(c: &mut Criterion) {
    let all = NodeSet::full();
    c.bench_function("node_set_iterate", |b| {
        b.iter(|| black_box(all).iter().filter(|n| n.index() % 2 == 0).count());
    });
}

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");
    for bound in [1usize, 8] {
        let pool = BufferPool::new(
            "bench",
            ImageAllocator::new(ImageSpec::new(ImageSize::new(640, 480), ImageFormat::Yuy2)),
        );
        pool.set_auto_allocate(bound);
        pool.allocate(bound).unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("request_return", bound), &pool, |b, pool| {
            b.iter(|| {
                let buffer = pool.request().unwrap();
                black_box(buffer.serial())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_evaluate, bench_node_sets, bench_pool);
criterion_main!(benches);
