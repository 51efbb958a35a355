//! Return-address hijacking for safepoint redirection.
//!
//! When the collector needs a thread that is running code with no
//! voluntary checkpoint (a tight native loop, say), it substitutes the
//! thread's pending return address: on its next ordinary return the
//! thread transfers into a collector-aware trampoline instead of its real
//! caller. The trampoline parks the thread at a safepoint, then resolves
//! the hijack and continues through the restored address as if nothing
//! happened.
//!
//! A hijack is an explicit state transition on the thread's
//! [`HijackRecord`]: none → installed → resolved-back-to-none. The record
//! exists exactly while the stack slot holds the trampoline address
//! rather than a real return address.
//!
//! Synchronization is ordering alone. The installer (one foreign thread,
//! exactly once) writes the record fields and then publishes the
//! trampoline into the slot with a release store; the owning thread's
//! acquire read of the slot on return makes the record visible. No other
//! thread ever touches the record.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bitflags::bitflags;
use thiserror::Error;

use crate::metrics;
use crate::thread::SharedThreadState;

bitflags! {
    /// Process-wide trap request flags polled at safepoints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrapFlags: u32 {
        /// A thread abort is being delivered somewhere in the process.
        const ABORT_IN_PROGRESS = 1;
        /// All threads must divert to a safepoint.
        const TRAP_THREADS = 2;
    }
}

/// A routine a hijacked thread is diverted into on its next return.
pub type HijackTarget = unsafe extern "C" fn();

/// Why a hijack could not be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HijackError {
    /// The target thread's safepoint flags suppress redirection.
    #[error("thread safepoint flags suppress hijack redirection")]
    Ineligible,
    /// The thread already has an outstanding hijack.
    #[error("a hijack is already installed for this thread")]
    AlreadyInstalled,
}

// ============================================================================
// Return-address slot
// ============================================================================

/// The stack location holding a thread's pending return address.
///
/// On a real frame this is the spilled link-register slot; here it is an
/// explicit atomic cell owned by the thread's frame so the substitution
/// is expressed as a store rather than a pointer-patching trick. The
/// owning thread "returns" by loading the value with acquire ordering.
#[derive(Debug)]
#[repr(transparent)]
pub struct ReturnAddressSlot(AtomicUsize);

impl ReturnAddressSlot {
    /// Creates a slot holding `return_address`.
    #[must_use]
    pub const fn new(return_address: usize) -> Self {
        Self(AtomicUsize::new(return_address))
    }

    /// The address control will transfer to on return.
    ///
    /// Acquire ordering pairs with the installer's release store, so a
    /// thread that observes the trampoline also observes the record that
    /// resolves it.
    #[must_use]
    pub fn value(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// HijackRecord
// ============================================================================

/// Per-thread hijack state: the real return address and where it came
/// from. At most one hijack is outstanding per thread.
#[derive(Debug)]
pub struct HijackRecord {
    return_address: AtomicUsize,
    slot: AtomicPtr<ReturnAddressSlot>,
}

impl HijackRecord {
    pub(crate) const fn new() -> Self {
        Self {
            return_address: AtomicUsize::new(0),
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether a hijack is currently outstanding.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        !self.slot.load(Ordering::Relaxed).is_null()
    }

    /// The saved real return address, while installed.
    #[must_use]
    pub fn saved_return_address(&self) -> usize {
        self.return_address.load(Ordering::Relaxed)
    }
}

// ============================================================================
// install / resolve
// ============================================================================

/// Installs a hijack on `thread`, diverting its next return into
/// `trampoline`.
///
/// Saves the slot's current address and location into the thread's
/// record, then overwrites the slot. Callers check eligibility as a
/// matter of policy before reaching for this; the operation still rejects
/// ineligible targets rather than corrupting a thread that is mid-way
/// through a no-GC region.
///
/// # Errors
///
/// [`HijackError::Ineligible`] if the thread's flags include
/// `DO_NOT_TRIGGER_GC` or `SUPPRESS_GC_STRESS`;
/// [`HijackError::AlreadyInstalled`] if a hijack is outstanding.
///
/// # Safety
///
/// `slot` must be the live return-address slot of `thread`'s current
/// frame and must remain valid until the thread resolves the hijack: the
/// record keeps a raw pointer to it. The caller must be the only
/// installer for this thread (in practice, the suspending collector).
pub unsafe fn install(
    thread: &SharedThreadState,
    slot: &ReturnAddressSlot,
    trampoline: HijackTarget,
) -> Result<(), HijackError> {
    if !thread.is_hijack_eligible() {
        return Err(HijackError::Ineligible);
    }
    let record = thread.hijack();
    if record.is_installed() {
        return Err(HijackError::AlreadyInstalled);
    }
    debug_assert!(
        thread
            .stack_bounds()
            .contains(ptr::from_ref(slot) as usize),
        "return-address slot outside the target thread's stack"
    );

    let original = slot.0.load(Ordering::Relaxed);
    record.return_address.store(original, Ordering::Relaxed);
    record
        .slot
        .store(ptr::from_ref(slot).cast_mut(), Ordering::Relaxed);
    // Publish last: a thread observing the trampoline must also observe
    // the record that undoes it.
    slot.0.store(trampoline as usize, Ordering::Release);

    metrics::boundary_metrics().note_hijack_installed();
    crate::tracing::internal::log_hijack_installed(thread.id());
    Ok(())
}

/// Resolves any outstanding hijack on `thread`, restoring the saved
/// return address into the saved slot location and clearing the record.
///
/// Runs on the hijacked thread itself, from inside the trampoline.
/// Idempotent: with no record outstanding this is a no-op, so threads may
/// be unhijacked defensively. Returns the restored address for the
/// trampoline to continue through.
pub fn resolve(thread: &SharedThreadState) -> Option<usize> {
    debug_assert!(
        crate::thread::current_id().is_none_or(|id| id == thread.id()),
        "hijack resolved from a foreign thread"
    );

    let record = thread.hijack();
    let slot_ptr = record.slot.load(Ordering::Acquire);
    if slot_ptr.is_null() {
        return None;
    }
    let original = record.return_address.load(Ordering::Relaxed);

    // SAFETY: install's contract keeps the slot alive until the owning
    // thread resolves, and only the owning thread reaches this store.
    unsafe {
        (*slot_ptr).0.store(original, Ordering::Release);
    }
    record.slot.store(ptr::null_mut(), Ordering::Relaxed);
    record.return_address.store(0, Ordering::Relaxed);

    metrics::boundary_metrics().note_hijack_resolved();
    crate::tracing::internal::log_hijack_resolved(thread.id());
    Some(original)
}

#[cfg(test)]
mod tests {
    use super::{install, resolve, HijackError, ReturnAddressSlot};
    use crate::thread::{SafepointFlags, SharedThreadState};

    unsafe extern "C" fn probe_trampoline() {}

    #[test]
    fn round_trip_restores_slot_and_clears_record() {
        let thread = SharedThreadState::for_tests();
        let slot = ReturnAddressSlot::new(0xCAFE);

        unsafe { install(&thread, &slot, probe_trampoline) }.unwrap();
        assert_eq!(slot.value(), probe_trampoline as usize);
        assert!(thread.hijack().is_installed());
        assert_eq!(thread.hijack().saved_return_address(), 0xCAFE);

        assert_eq!(resolve(&thread), Some(0xCAFE));
        assert_eq!(slot.value(), 0xCAFE);
        assert!(!thread.hijack().is_installed());
        assert_eq!(thread.hijack().saved_return_address(), 0);
    }

    #[test]
    fn resolve_without_install_is_a_no_op() {
        let thread = SharedThreadState::for_tests();
        assert_eq!(resolve(&thread), None);
        assert_eq!(resolve(&thread), None);
    }

    #[test]
    fn install_rejects_no_gc_threads() {
        let thread = SharedThreadState::for_tests();
        let slot = ReturnAddressSlot::new(0xCAFE);

        thread.set_flags(SafepointFlags::DO_NOT_TRIGGER_GC);
        let err = unsafe { install(&thread, &slot, probe_trampoline) };
        assert_eq!(err, Err(HijackError::Ineligible));
        assert_eq!(slot.value(), 0xCAFE, "rejected install must not touch the slot");
        assert!(!thread.hijack().is_installed());
    }

    #[test]
    fn install_rejects_gc_stress_suppressed_threads() {
        let thread = SharedThreadState::for_tests();
        let slot = ReturnAddressSlot::new(0xCAFE);

        thread.set_flags(SafepointFlags::SUPPRESS_GC_STRESS);
        let err = unsafe { install(&thread, &slot, probe_trampoline) };
        assert_eq!(err, Err(HijackError::Ineligible));
    }

    #[test]
    fn second_install_is_rejected() {
        let thread = SharedThreadState::for_tests();
        let slot = ReturnAddressSlot::new(0xCAFE);

        unsafe { install(&thread, &slot, probe_trampoline) }.unwrap();
        let err = unsafe { install(&thread, &slot, probe_trampoline) };
        assert_eq!(err, Err(HijackError::AlreadyInstalled));

        resolve(&thread);
    }
}
