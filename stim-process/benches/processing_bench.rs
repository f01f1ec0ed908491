//! Benchmarks for stim-process
//!
//! Measures per-frame processor cost at typical camera resolutions.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::{Duration, Instant};
use stim_frame::{Frame, FrameBufferPool, FrameStamp, PixelFormat, PoolConfig};
use stim_process::{ProcessingStage, ProcessorKind, ProjectorMapping, StageConfig};

fn test_frame(width: u32, height: u32) -> Frame {
    let pool = FrameBufferPool::new(PoolConfig::new(width, height, PixelFormat::Mono8)).unwrap();
    let mut buffer = pool.acquire().unwrap();
    for (i, px) in buffer.pixels_mut().iter_mut().enumerate() {
        // Sparse bright spots on a textured background
        *px = if i % 997 == 0 { 250 } else { (i % 61) as u8 };
    }
    let now = Instant::now();
    buffer.seal(FrameStamp {
        sequence: 0,
        trigger_at: now,
        captured_at: now,
    })
}

fn stage(kind: ProcessorKind, mapping: Option<ProjectorMapping>) -> ProcessingStage {
    let config = StageConfig {
        period: Duration::from_secs(1),
        soft_deadline: Duration::from_millis(900),
        threads: 0,
        mapping,
    };
    ProcessingStage::from_kind(kind, config).unwrap()
}

fn bench_processors(c: &mut Criterion) {
    let mut group = c.benchmark_group("processors");

    let kinds = [
        ("threshold", ProcessorKind::Threshold { level: 200 << 8 }),
        (
            "regions",
            ProcessorKind::Regions {
                level: 200 << 8,
                min_area: 1,
                max_regions: 64,
            },
        ),
        (
            "activity",
            ProcessorKind::Activity {
                tile: 32,
                z_threshold: 3.0,
            },
        ),
    ];

    for size in [512u32, 1024].iter() {
        for (name, kind) in kinds.iter() {
            let mut stage = stage(*kind, None);
            group.bench_with_input(BenchmarkId::new(*name, size), size, |b, &size| {
                b.iter_batched(
                    || test_frame(size, size),
                    |frame| black_box(stage.process(frame)),
                    criterion::BatchSize::LargeInput,
                );
            });
        }
    }

    group.finish();
}

fn bench_mapping(c: &mut Criterion) {
    let mapping = ProjectorMapping::from_row_major(
        [1.4, 0.05, 12.0, -0.05, 1.4, 8.0, 0.0, 0.0, 1.0],
        1280,
        800,
    )
    .unwrap();
    let mut stage = stage(ProcessorKind::Threshold { level: 200 << 8 }, Some(mapping));

    c.bench_function("threshold_warped_1024", |b| {
        b.iter_batched(
            || test_frame(1024, 1024),
            |frame| black_box(stage.process(frame)),
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_processors, bench_mapping);
criterion_main!(benches);
