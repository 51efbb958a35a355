//! Allocation-window invariants: the combined limit, fast-path bumping,
//! and failure without mutation.

use magpie_gc::{AllocContext, AllocWindow};
use rand::rngs::SmallRng;
use rand::SeedableRng;

fn rng() -> SmallRng {
    SmallRng::seed_from_u64(0x77_1234)
}

#[test]
fn combined_limit_never_exceeds_window() {
    let mut ctx = AllocContext::new();
    let mut r = rng();

    for i in 0..200 {
        let base = 0x1000 + i * 0x10_0000;
        let window = AllocWindow::new(base, base + 0x8_0000);
        let sampling = i % 2 == 0;
        ctx.refill(window, sampling, &mut r);
        assert!(
            ctx.combined_limit() <= ctx.alloc_limit(),
            "refill {i}: combined limit {:#x} past window end {:#x}",
            ctx.combined_limit(),
            ctx.alloc_limit()
        );

        // Recomputing mid-window must preserve the invariant too.
        let _ = ctx.try_alloc(0x100);
        ctx.update_combined_limit(sampling, &mut r);
        assert!(ctx.combined_limit() <= ctx.alloc_limit());
        assert!(ctx.combined_limit() >= ctx.alloc_ptr());
    }
}

#[test]
fn disabled_sampling_keeps_limits_equal() {
    let mut ctx = AllocContext::new();
    let mut r = rng();

    // Regardless of prior state: start with a sampling limit in place,
    // then turn sampling off.
    ctx.refill(AllocWindow::new(0x1000, 0x10_0000), true, &mut r);
    ctx.update_combined_limit(false, &mut r);
    assert_eq!(ctx.combined_limit(), ctx.alloc_limit());

    for _ in 0..20 {
        ctx.refill(AllocWindow::new(0x2000, 0x20_0000), false, &mut r);
        assert_eq!(ctx.combined_limit(), ctx.alloc_limit());
        let _ = ctx.try_alloc(64);
        ctx.update_combined_limit(false, &mut r);
        assert_eq!(ctx.combined_limit(), ctx.alloc_limit());
    }
}

#[test]
fn fast_path_hands_out_disjoint_ranges() {
    let mut ctx = AllocContext::new();
    ctx.refill(AllocWindow::new(0x1000, 0x9000), false, &mut rng());

    let sizes = [16usize, 256, 8, 4096, 64, 1024];
    let mut carved: Vec<(usize, usize)> = Vec::new();
    for size in sizes {
        let Some(address) = ctx.try_alloc(size) else {
            break;
        };
        assert!(address + size <= ctx.combined_limit());
        for &(prev_addr, prev_size) in &carved {
            let disjoint = address >= prev_addr + prev_size || address + size <= prev_addr;
            assert!(
                disjoint,
                "{address:#x}+{size:#x} overlaps {prev_addr:#x}+{prev_size:#x}"
            );
        }
        carved.push((address, size));
    }
    assert!(!carved.is_empty());
}

#[test]
fn failed_alloc_leaves_context_untouched() {
    let mut ctx = AllocContext::new();
    ctx.refill(AllocWindow::new(0x1000, 0x1100), false, &mut rng());
    let ptr_before = ctx.alloc_ptr();

    assert_eq!(ctx.try_alloc(0x200), None);
    assert_eq!(ctx.alloc_ptr(), ptr_before);
    assert_eq!(ctx.alloc_limit(), 0x1100);
    assert_eq!(ctx.combined_limit(), 0x1100);

    // An overflowing request fails the same way.
    assert_eq!(ctx.try_alloc(usize::MAX), None);
    assert_eq!(ctx.alloc_ptr(), ptr_before);
}

#[test]
fn end_to_end_window_scenario() {
    let mut ctx = AllocContext::new();
    ctx.refill(AllocWindow::new(0x1000, 0x2000), false, &mut rng());

    assert_eq!(ctx.try_alloc(0x100), Some(0x1000));
    assert_eq!(ctx.alloc_ptr(), 0x1100);

    // 0x1100 + 0xF80 = 0x2080 > 0x2000: must fail without mutating.
    assert_eq!(ctx.try_alloc(0xF80), None);
    assert_eq!(ctx.alloc_ptr(), 0x1100);
    assert_eq!(ctx.alloc_limit(), 0x2000);

    // The remaining 0xF00 bytes are still allocatable.
    assert_eq!(ctx.try_alloc(0xF00), Some(0x1100));
    assert_eq!(ctx.alloc_ptr(), 0x2000);
}

#[test]
fn init_returns_to_the_null_window() {
    let mut ctx = AllocContext::new();
    ctx.refill(AllocWindow::new(0x1000, 0x2000), false, &mut rng());
    assert!(ctx.try_alloc(0x10).is_some());

    ctx.init();
    assert_eq!(ctx.alloc_ptr(), 0);
    assert_eq!(ctx.alloc_limit(), 0);
    assert_eq!(ctx.combined_limit(), 0);
    assert_eq!(ctx.try_alloc(1), None);
}
