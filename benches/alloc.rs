// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocation strategy benchmarks for the hand-off buffers.
//
// Run with:
//   cargo bench --bench alloc --features bump_alloc
//
// Groups:
//   global     - Vec<u8> via the global allocator (baseline)
//   chunk_pool - fixed-size slots, alloc + dealloc
//   mem_pool   - region pool, alloc then reset
//   queue      - alloc + push + pop + release through a Queue
//   bump       - bumpalo arena, alloc then reset (feature = bump_alloc)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sdtp::mem::{ChunkPool, MemPool, Queue};

const SIZES: &[(&str, usize)] = &[("small_48", 48), ("medium_256", 256), ("large_4096", 4096)];

/// Allocations per iteration in the reset-style groups.
const BURST: usize = 32;

fn bench_global(c: &mut Criterion) {
    let mut group = c.benchmark_group("global");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| black_box(vec![0xABu8; sz]));
        });
    }
    group.finish();
}

fn bench_chunk_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_pool");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        let pool = ChunkPool::new(1024, size).expect("chunk pool");
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let p = pool.alloc().expect("slot");
                // Safety: the slot is at least `sz` bytes.
                unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, sz) };
                pool.dealloc(black_box(p)).expect("dealloc");
            });
        });
    }
    group.finish();
}

fn bench_mem_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("mem_pool");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes((size * BURST) as u64));
        let mut pool = MemPool::new(64 * 1024).expect("mem pool");
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                for _ in 0..BURST {
                    let p = pool.alloc(sz).expect("alloc");
                    // Safety: `alloc` returned `sz` writable bytes.
                    unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, sz) };
                    black_box(p);
                }
                pool.reset();
            });
        });
    }
    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        let q = Queue::new(1024, size).expect("queue");
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let mut blk = q.alloc(sz).expect("block");
                blk.fill(0xAB);
                q.push(blk).expect("push");
                black_box(q.pop());
            });
        });
    }
    group.finish();
}

#[cfg(feature = "bump_alloc")]
fn bench_bump(c: &mut Criterion) {
    let mut group = c.benchmark_group("bump");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes((size * BURST) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let mut arena = bumpalo::Bump::with_capacity(sz * BURST * 2);
            b.iter(|| {
                for _ in 0..BURST {
                    let s = arena.alloc_slice_fill_copy(sz, 0xABu8);
                    black_box(&*s);
                }
                arena.reset();
            });
        });
    }
    group.finish();
}

#[cfg(feature = "bump_alloc")]
criterion_group!(benches, bench_global, bench_chunk_pool, bench_mem_pool, bench_queue, bench_bump);

#[cfg(not(feature = "bump_alloc"))]
criterion_group!(benches, bench_global, bench_chunk_pool, bench_mem_pool, bench_queue);

criterion_main!(benches);
