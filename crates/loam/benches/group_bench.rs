//! Benchmarks for Loam segment groups.
//!
//! Run with: cargo bench --package loam
//!
//! ## Benchmark Categories
//!
//! - **Point reads**: layered lookups across a multi-segment stack,
//!   hits in the oldest layer (worst case) and misses (bloom-rejected)
//! - **Segment I/O**: writing and opening a segment file

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use loam::{
    CycleManager, Metrics, SegmentGroup, SegmentGroupConfig, SegmentWriter, Strategy,
    UnlimitedChecker,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const KEYS_PER_SEGMENT: usize = 1_000;

fn build_stack(dir: &std::path::Path, segment_count: usize) {
    for segment in 0..segment_count {
        let path = dir.join(format!("segment-{:04}.db", segment + 1));
        let mut writer = SegmentWriter::create(&path, Strategy::Replace, 0, true).unwrap();
        for key in 0..KEYS_PER_SEGMENT {
            let key = format!("key-{:04}-{:06}", segment + 1, key);
            writer.push_replace(key.as_bytes(), b"some payload bytes").unwrap();
        }
        writer.finish().unwrap();
    }
}

fn bench_group_get(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("group_get");
    for segment_count in [1usize, 4, 8] {
        let temp_dir = TempDir::new().unwrap();
        build_stack(temp_dir.path(), segment_count);

        let cycle = CycleManager::new(Duration::from_secs(3600));
        let group = SegmentGroup::open(
            SegmentGroupConfig::new(temp_dir.path(), Strategy::Replace),
            Arc::new(Metrics::new()),
            Arc::new(UnlimitedChecker),
            &cycle,
        )
        .unwrap();

        // a key in the oldest segment forces the full newest-to-oldest walk
        let deep_key = b"key-0001-000500".to_vec();
        bench_group.throughput(Throughput::Elements(1));
        bench_group.bench_with_input(
            BenchmarkId::new("hit_oldest", segment_count),
            &segment_count,
            |b, _| {
                b.iter(|| {
                    let value = group.get(black_box(&deep_key)).unwrap();
                    black_box(value)
                })
            },
        );

        bench_group.bench_with_input(
            BenchmarkId::new("miss", segment_count),
            &segment_count,
            |b, _| {
                b.iter(|| {
                    let value = group.get(black_box(b"key-none-000000")).unwrap();
                    black_box(value)
                })
            },
        );

        cycle.stop();
    }
    bench_group.finish();
}

fn bench_segment_write_and_open(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("segment_io");
    bench_group.throughput(Throughput::Elements(KEYS_PER_SEGMENT as u64));

    bench_group.bench_function("write_1k_keys", |b| {
        b.iter(|| {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("segment-0001.db");
            let mut writer = SegmentWriter::create(&path, Strategy::Replace, 0, true).unwrap();
            for key in 0..KEYS_PER_SEGMENT {
                let key = format!("key-{:06}", key);
                writer.push_replace(key.as_bytes(), b"some payload bytes").unwrap();
            }
            black_box(writer.finish().unwrap())
        })
    });

    bench_group.bench_function("open_1k_keys", |b| {
        let temp_dir = TempDir::new().unwrap();
        build_stack(temp_dir.path(), 1);
        let path = temp_dir.path().join("segment-0001.db");
        let opts = loam::segment::SegmentOpenOptions {
            mmap_contents: false,
            use_bloom_filter: true,
            calc_count_net_additions: false,
        };
        b.iter(|| black_box(loam::Segment::open(&path, &opts, None).unwrap()))
    });

    bench_group.finish();
}

criterion_group!(benches, bench_group_get, bench_segment_write_and_open);
criterion_main!(benches);
