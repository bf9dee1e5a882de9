//! Progressive encoder benchmarks
//!
//! Measures full-message encoding (DWT + quantization + RLGR + framing)
//! for typical damage patterns.

use boreal_rdp_server::damage::DamageRegion;
use boreal_rdp_server::egfx::progressive::ProgressiveEncoder;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn gradient_frame(width: usize, height: usize) -> Vec<u8> {
    let mut frame = vec![0u8; width * height * 4];
    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) * 4;
            frame[idx] = (x % 256) as u8;
            frame[idx + 1] = (y % 256) as u8;
            frame[idx + 2] = ((x + y) % 256) as u8;
        }
    }
    frame
}

fn bench_encode_region(c: &mut Criterion) {
    let mut group = c.benchmark_group("progressive_encode");

    let cases = [
        ("single_tile", 64u32, 64u32),
        ("hd_row", 1920, 64),
        ("full_1080p", 1920, 1088),
    ];

    for (name, width, height) in cases {
        let frame = gradient_frame(width as usize, height as usize);
        let rects = [DamageRegion::new(0, 0, width, height)];

        group.throughput(Throughput::Elements(u64::from(width) * u64::from(height)));
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let mut encoder = ProgressiveEncoder::new();
            b.iter(|| {
                black_box(
                    encoder
                        .encode_region(
                            black_box(&frame),
                            width as usize * 4,
                            width as u16,
                            height as u16,
                            &rects,
                            false,
                        )
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_region);
criterion_main!(benches);
