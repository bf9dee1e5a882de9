//! Damage detection benchmarks
//!
//! Measures tile-based frame comparison at various resolutions: identical
//! frames (best case), a small damaged region (typing/cursor), and full
//! frame changes (video playback).

use boreal_rdp_server::buffer::{BufferPool, PooledBuffer};
use boreal_rdp_server::damage::{DamageDetector, MemcmpDetector};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const RESOLUTIONS: [(u32, u32, &str); 3] = [
    (1280, 720, "720p"),
    (1920, 1080, "1080p"),
    (3840, 2160, "4K"),
];

fn gradient_frame(pool: &BufferPool, width: u32, offset: u32) -> PooledBuffer {
    let mut buffer = pool.acquire();
    let stride = buffer.stride() as usize;
    let height = buffer.height();
    let data = buffer.local_data_mut().unwrap();
    for y in 0..height {
        for x in 0..width {
            let idx = y as usize * stride + x as usize * 4;
            data[idx] = ((x + offset) % 256) as u8;
            data[idx + 1] = ((y + offset) % 256) as u8;
            data[idx + 2] = 128;
        }
    }
    buffer
}

fn frame_with_damage(pool: &BufferPool, base: &PooledBuffer, x0: u32, y0: u32, size: u32) -> PooledBuffer {
    let mut buffer = pool.acquire();
    let stride = buffer.stride() as usize;
    let height = buffer.height();
    let width = buffer.width();
    buffer
        .local_data_mut()
        .unwrap()
        .copy_from_slice(base.local_data().unwrap());
    let data = buffer.local_data_mut().unwrap();
    for y in y0..(y0 + size).min(height) {
        for x in x0..(x0 + size).min(width) {
            let idx = y as usize * stride + x as usize * 4;
            data[idx] = 0xff;
        }
    }
    buffer
}

fn bench_identical_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("damage_identical");

    for (width, height, name) in RESOLUTIONS {
        group.throughput(Throughput::Elements(u64::from(width) * u64::from(height)));
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let pool = BufferPool::new(4);
            pool.resize_buffers(width, height, width * 4).unwrap();
            let mut detector = MemcmpDetector::new();
            detector.resize_surface(width, height).unwrap();
            detector
                .submit_new_framebuffer(gradient_frame(&pool, width, 0))
                .unwrap();

            b.iter(|| {
                detector
                    .submit_new_framebuffer(black_box(gradient_frame(&pool, width, 0)))
                    .unwrap();
                black_box(detector.is_region_damaged())
            })
        });
    }

    group.finish();
}

fn bench_partial_damage(c: &mut Criterion) {
    let mut group = c.benchmark_group("damage_partial");

    for (width, height, name) in RESOLUTIONS {
        group.throughput(Throughput::Elements(u64::from(width) * u64::from(height)));
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let pool = BufferPool::new(4);
            pool.resize_buffers(width, height, width * 4).unwrap();
            let mut detector = MemcmpDetector::new();
            detector.resize_surface(width, height).unwrap();
            let base = gradient_frame(&pool, width, 0);
            let damaged = frame_with_damage(&pool, &base, width / 2, height / 2, 96);
            detector.submit_new_framebuffer(base).unwrap();

            b.iter_batched(
                || frame_with_damage(&pool, &damaged, width / 2, height / 2, 96),
                |frame| {
                    detector.submit_new_framebuffer(black_box(frame)).unwrap();
                    black_box(detector.get_damage_region().unwrap())
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_full_damage(c: &mut Criterion) {
    let mut group = c.benchmark_group("damage_full");

    for (width, height, name) in RESOLUTIONS {
        group.throughput(Throughput::Elements(u64::from(width) * u64::from(height)));
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let pool = BufferPool::new(4);
            pool.resize_buffers(width, height, width * 4).unwrap();
            let mut detector = MemcmpDetector::new();
            detector.resize_surface(width, height).unwrap();
            detector
                .submit_new_framebuffer(gradient_frame(&pool, width, 0))
                .unwrap();

            let mut offset = 0;
            b.iter(|| {
                offset += 1;
                detector
                    .submit_new_framebuffer(gradient_frame(&pool, width, offset))
                    .unwrap();
                black_box(detector.get_damage_region().unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_identical_frames,
    bench_partial_damage,
    bench_full_damage
);
criterion_main!(benches);
