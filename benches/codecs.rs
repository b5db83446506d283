//! Benchmark chunk codecs and downscalers.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array4;
use precomputed::compressed_segmentation;
use precomputed::downscaling::{AveragingDownscaler, MajorityDownscaler, StridingDownscaler};
use precomputed::{Downscaler, VoxelBlock};

/// Labels forming slabs of a few voxels, so blocks hold a handful of values
fn labels(size: usize) -> Array4<u64> {
    Array4::from_shape_fn((1, size, size, size), |(_, z, y, x)| {
        (x / 5 + 7 * (y / 6) + 49 * (z / 3)) as u64
    })
}

fn codec_compressed_segmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_compressed_segmentation");
    for size in [32usize, 64, 128] {
        let array = labels(size);
        let encoded = compressed_segmentation::encode(&array, [8, 8, 8]).unwrap();
        group.throughput(Throughput::Bytes((size * size * size * 8) as u64));
        group.bench_function(BenchmarkId::new("encode", size), |b| {
            b.iter(|| compressed_segmentation::encode(black_box(&array), [8, 8, 8]).unwrap());
        });
        group.bench_function(BenchmarkId::new("decode", size), |b| {
            b.iter(|| {
                compressed_segmentation::decode::<u64>(
                    black_box(&encoded),
                    1,
                    [size, size, size],
                    [8, 8, 8],
                )
                .unwrap()
            });
        });
    }
    group.finish();
}

fn downscale(c: &mut Criterion) {
    let mut group = c.benchmark_group("downscale");
    let image = VoxelBlock::from_array(Array4::from_shape_fn((1, 64, 64, 64), |(_, z, y, x)| {
        (x * 3 + y * 5 + z * 7) as u16
    }));
    let segmentation = VoxelBlock::from_array(labels(64));
    group.throughput(Throughput::Elements(64 * 64 * 64));

    let average = AveragingDownscaler::new(None);
    group.bench_function("average_u16", |b| {
        b.iter(|| average.downscale(black_box(&image), [2, 2, 2]).unwrap());
    });
    group.bench_function("majority_u64", |b| {
        b.iter(|| MajorityDownscaler.downscale(black_box(&segmentation), [2, 2, 2]).unwrap());
    });
    group.bench_function("stride_u16", |b| {
        b.iter(|| StridingDownscaler.downscale(black_box(&image), [2, 2, 1]).unwrap());
    });
    group.finish();
}

criterion_group!(benches, codec_compressed_segmentation, downscale);
criterion_main!(benches);
