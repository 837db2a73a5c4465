//! Criterion benchmarks for building and running multiversioned blocks as the number of cases
//! grows.

use bbdup::{BuildFlags, testing::TestClient};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::{hint::black_box, sync::Arc};
use tests::{Fixture, TAG, block, initial_context};

const CASE_COUNTS: [u16; 3] = [1, 4, 16];

fn fixture(cases: u16) -> Fixture {
    let encs = (1..=u64::from(cases)).collect::<Vec<_>>();
    Fixture::new(
        TestClient::new(0)
            .with_cases(&encs)
            .without_dynamic_handling(),
        true,
        |o| o.dup_limit = cases,
    )
}

fn instrument(c: &mut Criterion) {
    let mut group = c.benchmark_group("instrument");
    for n in CASE_COUNTS {
        let f = fixture(n);
        let mut t = f.thread();
        let e = Arc::clone(&f.engine);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let mut l = block(TAG);
                e.instrument_block(t.tc_mut(), TAG, &mut l, BuildFlags::default());
                e.on_block_deleted(t.tc_mut(), TAG);
                black_box(l)
            })
        });
    }
    group.finish();
}

fn execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    for n in CASE_COUNTS {
        let f = fixture(n);
        // The last variant in layout order is the slowest to reach.
        f.set_dispatch(u64::from(n));
        let mut t = f.thread();
        t.block(TAG);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| black_box(t.run(TAG, initial_context())))
        });
    }
    group.finish();
}

criterion_group!(benches, instrument, execute);
criterion_main!(benches);
