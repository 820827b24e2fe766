//! Criterion micro-benchmarks for the shared state structures.
//!
//! Benchmarks:
//! - Cleary table insert throughput (sequential, by table size)
//! - Cleary table lookup of present keys
//! - Cleary table contended insert of overlapping keys
//! - Lattice map insert/iterate on one key
//! - Frame stack enter/push/leave cycle

use std::hint::black_box;
use std::ops::ControlFlow;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use mcscc_store::{ClearyTable, FrameStack, LatticeMap, LatticeMapConfig};

fn criterion_config() -> Criterion {
    Criterion::default().configure_from_args()
}

fn key(i: u64) -> u64 {
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

// ---------------------------------------------------------------------------
// Cleary table benchmarks
// ---------------------------------------------------------------------------

/// Benchmark: insert distinct keys into a fresh table.
fn bench_table_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("cleary_table/insert");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(5));

    for &n in &[1_000_u64, 10_000, 100_000] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::new("keys", n), &n, |b, &count| {
            b.iter_batched(
                || ClearyTable::new(18).unwrap(),
                |table| {
                    for i in 0..count {
                        table.find_or_put(key(i), true).unwrap();
                    }
                    table
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark: look up keys that are present.
fn bench_table_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cleary_table/lookup");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    let table = ClearyTable::new(16).unwrap();
    for i in 0..20_000 {
        table.find_or_put(key(i), true).unwrap();
    }
    let mut i = 0_u64;
    group.bench_function("present", |b| {
        b.iter(|| {
            i = (i + 1) % 20_000;
            black_box(table.find_or_put(black_box(key(i)), false).unwrap())
        });
    });

    group.finish();
}

/// Benchmark: 4 threads inserting the same key sequence.
fn bench_table_contended(c: &mut Criterion) {
    const THREADS: usize = 4;
    const KEYS: u64 = 10_000;
    let mut group = c.benchmark_group("cleary_table/contended");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));
    group.throughput(Throughput::Elements(KEYS));

    group.bench_function("overlapping_4_threads", |b| {
        b.iter_batched(
            || Arc::new(ClearyTable::new(16).unwrap()),
            |table| {
                let barrier = Arc::new(Barrier::new(THREADS));
                let handles: Vec<_> = (0..THREADS)
                    .map(|_| {
                        let t = Arc::clone(&table);
                        let bar = Arc::clone(&barrier);
                        thread::spawn(move || {
                            bar.wait();
                            for i in 0..KEYS {
                                t.find_or_put(key(i), true).unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                table
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Lattice map benchmarks
// ---------------------------------------------------------------------------

/// Benchmark: grow one key's chain, then iterate it.
fn bench_lattice_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("lattice_map");
    group.sample_size(50);

    for &n in &[8_u64, 64, 512] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::new("insert_iterate", n), &n, |b, &count| {
            b.iter_batched(
                || LatticeMap::new(&LatticeMapConfig::new(64, 1).with_arena_factor(64)).unwrap(),
                |map| {
                    {
                        let h = map.register().unwrap();
                        for v in 0..count {
                            h.insert(3, v, 0).unwrap();
                        }
                    }
                    let mut sum = 0_u64;
                    map.iterate(3, |e| {
                        sum += e.value;
                        ControlFlow::Continue(())
                    });
                    black_box(sum);
                    map
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Frame stack benchmarks
// ---------------------------------------------------------------------------

/// Benchmark: a DFS-shaped enter/push/leave cycle.
fn bench_frame_stack(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_stack");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("dfs_cycle_1000", |b| {
        let mut stack: FrameStack<u32> = FrameStack::with_capacity(4_096);
        b.iter(|| {
            stack.push(0);
            for depth in 0..1_000_u32 {
                stack.enter();
                stack.push(depth);
                stack.push(depth + 1);
            }
            for _ in 0..1_000 {
                stack.leave();
            }
            black_box(stack.pop());
        });
    });

    group.finish();
}

criterion_group!(
    name = benches;
    config = criterion_config();
    targets = bench_table_insert,
        bench_table_lookup,
        bench_table_contended,
        bench_lattice_map,
        bench_frame_stack
);
criterion_main!(benches);
