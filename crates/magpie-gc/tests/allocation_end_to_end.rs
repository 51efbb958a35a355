//! End-to-end allocation through the helper entry points: fast path,
//! window refills, sampling traps, flagged allocations, and exhaustion.

use magpie_gc::{
    allocate, attach_current, detach_current, AllocFlags, HeapConfig, HeapKind, HeapRegistry,
    OutOfMemory,
};

fn loaded(config: HeapConfig) -> HeapRegistry {
    let registry = HeapRegistry::new();
    registry.load(&config).unwrap();
    registry
}

#[test]
fn allocations_are_disjoint_and_inside_the_heap() {
    let registry = loaded(HeapConfig {
        kind: Some(HeapKind::Workstation),
        // Every oversized request replaces the current window and leaks
        // its remainder, so reserve well past the payload total.
        reserve_bytes: 32 * 1024 * 1024,
        thread_alloc_contexts: Some(true),
        ..HeapConfig::default()
    });
    attach_current(registry.threads());

    let sizes = [8usize, 24, 64, 256, 4096, 16, 96 * 1024, 40];
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for _ in 0..64 {
        for &size in &sizes {
            let address = allocate(&registry, size, AllocFlags::empty()).unwrap();
            assert!(
                registry.globals().in_heap_range(address),
                "{address:#x} outside the tracked heap"
            );
            spans.push((address, size));
        }
    }

    spans.sort_unstable();
    for pair in spans.windows(2) {
        let (addr, size) = pair[0];
        assert!(
            addr + size <= pair[1].0,
            "{addr:#x}+{size:#x} overlaps {:#x}",
            pair[1].0
        );
    }
    detach_current(registry.threads());
}

#[test]
fn shared_context_serves_all_threads_when_private_ones_are_off() {
    let registry = loaded(HeapConfig {
        kind: Some(HeapKind::Workstation),
        reserve_bytes: 8 * 1024 * 1024,
        thread_alloc_contexts: Some(false),
        ..HeapConfig::default()
    });
    assert!(!registry.uses_thread_alloc_contexts());

    let collected = std::sync::Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                attach_current(registry.threads());
                let mut local = Vec::new();
                for _ in 0..500 {
                    local.push(allocate(&registry, 64, AllocFlags::empty()).unwrap());
                }
                collected.lock().unwrap().extend(local);
                detach_current(registry.threads());
            });
        }
    });

    let mut addresses = collected.into_inner().unwrap();
    let total = addresses.len();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), total, "shared CAS bump handed out a span twice");
}

#[test]
fn sampling_traps_publish_samples_inside_the_heap() {
    let registry = loaded(HeapConfig {
        kind: Some(HeapKind::Workstation),
        reserve_bytes: 64 * 1024 * 1024,
        window_bytes: 16 * 1024,
        sampling_enabled: true,
        thread_alloc_contexts: Some(true),
        ..HeapConfig::default()
    });
    attach_current(registry.threads());
    assert!(registry.is_sampling_enabled());

    // ~256 windows at a 100KiB sampling mean: the odds of zero traps are
    // negligible.
    for _ in 0..32_768 {
        allocate(&registry, 128, AllocFlags::empty()).unwrap();
    }

    let samples = registry.samples().unwrap();
    assert!(!samples.is_empty(), "no sampling trap fired in 4MiB of allocation");
    while let Some(sample) = samples.pop() {
        assert!(registry.globals().in_heap_range(sample.address));
        assert_eq!(sample.size, 128);
    }
    detach_current(registry.threads());
}

#[test]
fn disabling_sampling_stops_new_traps() {
    let registry = loaded(HeapConfig {
        kind: Some(HeapKind::Workstation),
        reserve_bytes: 64 * 1024 * 1024,
        window_bytes: 16 * 1024,
        sampling_enabled: true,
        thread_alloc_contexts: Some(true),
        ..HeapConfig::default()
    });
    attach_current(registry.threads());

    registry.set_sampling_enabled(false);
    // The next refill picks the change up; drain whatever the current
    // window still owes.
    for _ in 0..1024 {
        allocate(&registry, 128, AllocFlags::empty()).unwrap();
    }
    while registry.samples().unwrap().pop().is_some() {}

    for _ in 0..16_384 {
        allocate(&registry, 128, AllocFlags::empty()).unwrap();
    }
    assert!(
        registry.samples().unwrap().is_empty(),
        "a sample fired with sampling disabled"
    );
    detach_current(registry.threads());
}

#[test]
fn flagged_allocations_honor_alignment_kinds() {
    let registry = loaded(HeapConfig {
        kind: Some(HeapKind::Server),
        reserve_bytes: 8 * 1024 * 1024,
        ..HeapConfig::default()
    });
    attach_current(registry.threads());

    let plain = allocate(&registry, 128, AllocFlags::ALIGN8).unwrap();
    assert_eq!(plain % 8, 0);

    let biased = allocate(&registry, 128, AllocFlags::ALIGN8_BIAS).unwrap();
    assert_eq!(biased % 8, 4, "biased allocation must sit 4 past an 8-byte boundary");

    let finalizable = allocate(&registry, 128, AllocFlags::FINALIZE).unwrap();
    assert!(registry.globals().in_heap_range(finalizable));
    detach_current(registry.threads());
}

#[test]
fn exhaustion_surfaces_out_of_memory() {
    let registry = loaded(HeapConfig {
        kind: Some(HeapKind::Workstation),
        reserve_bytes: 256 * 1024,
        window_bytes: 64 * 1024,
        thread_alloc_contexts: Some(true),
        ..HeapConfig::default()
    });
    attach_current(registry.threads());

    let mut served = 0usize;
    let error = loop {
        match allocate(&registry, 4096, AllocFlags::empty()) {
            Ok(_) => served += 4096,
            Err(error) => break error,
        }
    };
    assert_eq!(error, OutOfMemory { requested: 4096 });
    assert!(served > 0, "a 256KiB heap must serve something before failing");
    assert!(served <= 256 * 1024);

    // Exhaustion is not latched: the error is returned each time.
    assert!(allocate(&registry, 4096, AllocFlags::empty()).is_err());
    detach_current(registry.threads());
}
