//! Loom model for the hijack handoff: the installer publishes the
//! trampoline into the return-address slot, the owner observes it and
//! resolves back. The record fields must be visible to the owner by the
//! time it sees the trampoline.
#![cfg(feature = "test-util")]

use std::sync::Arc;

use magpie_gc::{install, resolve, ReturnAddressSlot, SharedThreadState};

unsafe extern "C" fn park_trampoline() {}

#[test]
#[ignore = "loom test - run with cargo test --release --features test-util loom_hijack_handoff -- --ignored"]
fn loom_hijack_handoff() {
    loom::model(|| {
        let thread = SharedThreadState::for_tests();
        let slot = Arc::new(ReturnAddressSlot::new(0xFEED));

        let installer = loom::thread::spawn({
            let thread = Arc::clone(&thread);
            let slot = Arc::clone(&slot);
            move || {
                unsafe { install(&thread, &slot, park_trampoline) }.unwrap();
            }
        });
        installer.join().unwrap();

        // The owner's next return: the slot holds the trampoline, and the
        // record it publishes must already be complete.
        assert_eq!(slot.value(), park_trampoline as usize);
        assert_eq!(thread.hijack().saved_return_address(), 0xFEED);

        assert_eq!(resolve(&thread), Some(0xFEED));
        assert_eq!(slot.value(), 0xFEED);
        assert!(!thread.hijack().is_installed());
    });
}

#[test]
#[ignore = "loom test - run with cargo test --release --features test-util loom_defensive_unhijack -- --ignored"]
fn loom_defensive_unhijack_races_nothing() {
    loom::model(|| {
        let thread = SharedThreadState::for_tests();

        // A defensive unhijack concurrent with an installer that never
        // ran must stay a no-op.
        let owner = loom::thread::spawn({
            let thread = Arc::clone(&thread);
            move || resolve(&thread)
        });
        assert_eq!(owner.join().unwrap(), None);
        assert!(!thread.hijack().is_installed());
    });
}
