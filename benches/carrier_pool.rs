//! Benchmarks for carrier pool operations
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use isp_groups::carrier::CarrierPool;
use isp_groups::GroupHandle;

const TAA: GroupHandle = GroupHandle(2);
const ISP: GroupHandle = GroupHandle(3);
const MCS: GroupHandle = GroupHandle(6);

fn bench_claim_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_release");
    group.throughput(Throughput::Elements(1));

    let pool = CarrierPool::new(0, 32, 12);
    group.bench_function("single_stage", |b| {
        b.iter(|| {
            let mut state = pool.lock();
            let id = state.claim(black_box(TAA)).unwrap();
            state.release(id, TAA).unwrap();
        });
    });

    group.finish();
}

fn bench_memory_chain_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_chain_handoff");
    group.throughput(Throughput::Elements(1));

    // 3AA -> ISP -> MCS, one carrier travelling the whole chain
    let pool = CarrierPool::new(0, 32, 12);
    group.bench_function("three_stages", |b| {
        b.iter(|| {
            let mut state = pool.lock();
            let id = state.claim(TAA).unwrap();
            state.transfer(id, TAA, ISP).unwrap();
            state.transfer(id, ISP, MCS).unwrap();
            state.release(black_box(id), MCS).unwrap();
        });
    });

    group.finish();
}

fn bench_rewind(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewind");

    for depth in [1usize, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::new("stale_carriers", depth), depth, |b, &depth| {
            let pool = CarrierPool::new(0, 32, 12);
            b.iter(|| {
                let mut state = pool.lock();
                // Older carriers are dropped until the target tag is at the head
                for fcount in 1..=depth as u32 + 1 {
                    let id = state.claim(ISP).unwrap();
                    state.carrier_mut(id).unwrap().fcount = fcount;
                }
                let found = state.rewind(ISP, black_box(depth as u32 + 1)).unwrap();
                state.release(found, ISP).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_release,
    bench_memory_chain_handoff,
    bench_rewind
);
criterion_main!(benches);
