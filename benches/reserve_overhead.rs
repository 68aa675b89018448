//! Append buffer hot-path benchmark
//!
//! Every instrumented load and store ends in one `reserve` + copy on the shared
//! mapping, so this is the cost the traced program pays per memory access.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench reserve_overhead
//! ```
//!
//! # Expected Output
//!
//! ```text
//! append_access_record    time:   [5 ns 6 ns 8 ns]
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use memtrace::encoder::{EncoderOptions, EventEncoder};
use memtrace::record::{AccessKind, AccessRecord, ACCESS_RECORD_LEN};
use memtrace::sink::TraceSink;
use memtrace::suppression::SuppressionTable;
use memtrace::TraceBuffer;
use std::sync::Arc;
use tempfile::TempDir;

/// Large enough that a benchmark run never fills it
const BENCH_CAPACITY: u64 = 1 << 30;

fn open_buffer(dir: &TempDir) -> TraceBuffer {
    TraceBuffer::open(dir.path().join("bench.bin"), BENCH_CAPACITY).unwrap()
}

/// Benchmark: raw reservation plus record copy
fn bench_append_access_record(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let buffer = open_buffer(&dir);
    let mut i = 0u64;

    c.bench_function("append_access_record", |b| {
        b.iter(|| {
            let record = AccessRecord::new(1, AccessKind::Read, i);
            let _ = black_box(buffer.append(black_box(&record.encode())));
            i += 8;
        });
    });
}

/// Benchmark: encoder path including the suppression check
fn bench_encoder_record_access(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let buffer: Arc<dyn TraceSink> = Arc::new(open_buffer(&dir));
    let encoder = EventEncoder::new(
        buffer,
        Arc::new(SuppressionTable::default()),
        EncoderOptions::default(),
    );
    let mut i = 0u64;

    c.bench_function("encoder_record_access", |b| {
        b.iter(|| {
            encoder.record_access(1, 0x400000, AccessKind::Write, black_box(i), false);
            i += 8;
        });
    });
}

/// Benchmark: silenced thread (no reservation at all)
fn bench_encoder_suppressed(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let buffer: Arc<dyn TraceSink> = Arc::new(open_buffer(&dir));
    let suppression = Arc::new(SuppressionTable::default());
    suppression.enter_silent_region(0x601040, 1);
    let encoder = EventEncoder::new(buffer, suppression, EncoderOptions::default());

    c.bench_function("encoder_record_access_suppressed", |b| {
        b.iter(|| {
            encoder.record_access(1, 0x400000, AccessKind::Read, black_box(0x1000), false);
        });
    });
}

/// Benchmark: contended reservation from several threads
///
/// Measures one batch of 10_000 records per thread sharing a single cursor.
fn bench_contended_reserve(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_reserve");
    let per_thread = 10_000u64;

    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter_with_setup(
                    || {
                        let dir = TempDir::new().unwrap();
                        let capacity = 8 + threads as u64 * per_thread * ACCESS_RECORD_LEN;
                        let buffer =
                            TraceBuffer::open(dir.path().join("bench.bin"), capacity).unwrap();
                        (dir, buffer)
                    },
                    |(_dir, buffer)| {
                        std::thread::scope(|s| {
                            for t in 0..threads {
                                let buffer = &buffer;
                                s.spawn(move || {
                                    let record =
                                        AccessRecord::new(t as u8, AccessKind::Write, 0x1000);
                                    for _ in 0..per_thread {
                                        buffer.append(&record.encode()).unwrap();
                                    }
                                });
                            }
                        });
                    },
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_append_access_record,
    bench_encoder_record_access,
    bench_encoder_suppressed,
    bench_contended_reserve
);
criterion_main!(benches);
