//! Benchmark: the allocation fast path.
//!
//! Measures the bump-pointer cost for the thread-exclusive context, the
//! same path with sampling folded into the limit, and the shared
//! compare-and-swap variant.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use magpie_gc::{AllocContext, AllocWindow, SharedAllocContext};
use rand::rngs::SmallRng;
use rand::SeedableRng;

const WINDOW: AllocWindow = AllocWindow::new(0x10_0000, 0x10_0000 + (1 << 24));

fn bench_exclusive_bump(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(1);
    let mut ctx = AllocContext::new();
    ctx.refill(WINDOW, false, &mut rng);

    c.bench_function("bump_64b_exclusive", |b| {
        b.iter(|| match ctx.try_alloc(black_box(64)) {
            Some(address) => {
                black_box(address);
            }
            None => ctx.refill(WINDOW, false, &mut rng),
        });
    });
}

fn bench_exclusive_bump_sampling(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(2);
    let mut ctx = AllocContext::new();
    ctx.refill(WINDOW, true, &mut rng);

    c.bench_function("bump_64b_exclusive_sampling", |b| {
        b.iter(|| {
            if let Some(address) = ctx.try_alloc(black_box(64)) {
                black_box(address);
            } else if ctx.crosses_sampling_limit(64) {
                black_box(ctx.take_sampled_alloc(64));
                ctx.update_combined_limit(true, &mut rng);
            } else {
                ctx.refill(WINDOW, true, &mut rng);
            }
        });
    });
}

fn bench_shared_cas_bump(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(3);
    let ctx = SharedAllocContext::new();
    ctx.refill(WINDOW, false, &mut rng);

    c.bench_function("bump_64b_shared_cas", |b| {
        b.iter(|| match ctx.try_alloc(black_box(64)) {
            Some(address) => {
                black_box(address);
            }
            None => ctx.refill(WINDOW, false, &mut rng),
        });
    });
}

criterion_group!(
    benches,
    bench_exclusive_bump,
    bench_exclusive_bump_sampling,
    bench_shared_cas_bump
);
criterion_main!(benches);
