//! Helper entry points consumed by code generators.
//!
//! Emitted code calls a small, fixed roster of unmanaged helpers: the
//! allocation helper, the collection-wait helper, the exception-raising
//! helpers, and the safepoint poll. Each one follows the transition-frame
//! protocol: the frame is built and linked before any operation that
//! could provoke the collector, so a collection triggered mid-helper can
//! still walk this thread's stack from the helper's caller.
//!
//! The modeled calling convention passes two argument registers; their
//! reference taint in the frame matches what each helper actually carries
//! (the managed-throw helper's argument register 0 holds the exception
//! object, so its frame marks `ARG0_GCREF`).

use std::ptr;
use std::sync::Arc;

use thiserror::Error;

use crate::alloc::{AllocFlags, AllocSample};
use crate::frame::{PushedFrame, RegisterFile, TransitionFrame};
use crate::hijack::{self, TrapFlags};
use crate::metrics;
use crate::registry::HeapRegistry;
use crate::thread::{self, SharedThreadState};

/// The heap could not satisfy an allocation even after a collection.
///
/// The execution engine turns this into its user-visible failure; the
/// boundary layer never retries indefinitely on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory allocating {requested} bytes")]
pub struct OutOfMemory {
    /// The allocation size that could not be satisfied.
    pub requested: usize,
}

/// The execution engine's exception dispatch, registered on the
/// [`HeapRegistry`]. Dispatch internals live outside the boundary layer.
pub trait ExceptionPort: Send + Sync {
    /// Surfaces a hardware fault (access violation, trap) to managed
    /// code.
    fn raise_hardware_fault(&self, code: u32, fault_address: usize) -> !;

    /// Throws a managed exception object.
    fn raise_managed(&self, exception: usize) -> !;

    /// Rethrows the in-flight exception.
    fn rethrow(&self) -> !;
}

/// Captures the register file a helper frame records.
///
/// The stack pointer is the helper's own entry approximation: the address
/// of a stack local, the same trick the conservative scanner uses to find
/// its own top of stack.
fn helper_register_file(anchor: &usize, args: [usize; 2]) -> RegisterFile {
    RegisterFile {
        sp: ptr::from_ref(anchor) as usize,
        args,
        ..RegisterFile::default()
    }
}

fn current_shared() -> Arc<SharedThreadState> {
    thread::with_current(|t| Arc::clone(t.shared()))
}

// ============================================================================
// Allocation
// ============================================================================

/// The allocation helper.
///
/// The fast path is branch-minimal and lock-free: one bump attempt
/// against the calling thread's window (or one compare-and-swap against
/// the shared window). Anything else (window exhaustion, a sampling
/// trap, a flagged allocation) drops into [`alloc_slow`].
///
/// # Errors
///
/// [`OutOfMemory`] when the heap cannot satisfy the request even after a
/// collection completes.
///
/// # Panics
///
/// Panics if the calling thread is not attached to the runtime.
#[inline]
pub fn allocate(registry: &HeapRegistry, size: usize, flags: AllocFlags) -> Result<usize, OutOfMemory> {
    debug_assert!(size > 0, "zero-sized allocation request");
    if flags.is_empty() {
        let fast = if registry.uses_thread_alloc_contexts() {
            thread::with_current(|t| t.with_alloc(|ctx| ctx.try_alloc(size)))
        } else {
            registry.shared_alloc_context().try_alloc(size)
        };
        if let Some(address) = fast {
            return Ok(address);
        }
    }
    alloc_slow(registry, size, flags)
}

/// The allocation slow path.
///
/// Entered when the fast path fails or the allocation carries kind flags.
/// Links a transition frame first: refilling may block behind an
/// in-progress collection, and flagged allocations go straight to the
/// heap.
///
/// # Errors
///
/// [`OutOfMemory`] when the heap cannot satisfy the request even after a
/// collection completes.
///
/// # Panics
///
/// Panics if the calling thread is not attached to the runtime.
#[cold]
#[inline(never)]
pub fn alloc_slow(
    registry: &HeapRegistry,
    size: usize,
    flags: AllocFlags,
) -> Result<usize, OutOfMemory> {
    metrics::boundary_metrics().note_slow_path();
    let shared = current_shared();

    let anchor = 0usize;
    let regs = helper_register_file(&anchor, [size, flags.bits() as usize]);
    let frame = TransitionFrame::build(shared.id(), &regs);
    let _pushed = PushedFrame::link(&shared, &frame);

    if flags.is_empty() {
        alloc_from_window(registry, size)
    } else {
        alloc_flagged(registry, size, flags)
    }
}

fn alloc_from_window(registry: &HeapRegistry, size: usize) -> Result<usize, OutOfMemory> {
    let heap = registry.get();
    let mut waited = false;
    loop {
        // A sampling trap is not exhaustion: the allocation fits the real
        // window, so take it, report it, and draw the next threshold.
        if let Some(address) = take_sampled(registry, size) {
            publish_sample(registry, address, size);
            return Ok(address);
        }

        if let Some(address) = retry_fast(registry, size) {
            return Ok(address);
        }

        if let Some(window) = heap.refill_window(size) {
            metrics::boundary_metrics().note_window_refilled();
            crate::tracing::internal::log_window_refilled(window.base, window.limit);
            let sampling = registry.is_sampling_enabled();
            if registry.uses_thread_alloc_contexts() {
                thread::with_current(|t| {
                    t.with_rng(|rng| t.with_alloc(|ctx| ctx.refill(window, sampling, rng)));
                });
            } else {
                thread::with_current(|t| {
                    t.with_rng(|rng| registry.shared_alloc_context().refill(window, sampling, rng));
                });
            }
            continue;
        }

        // Exhausted. Let one collection reclaim space, then try again;
        // a second exhaustion is a real out-of-memory.
        if waited {
            return Err(OutOfMemory { requested: size });
        }
        registry.wait_for_collection_to_finish();
        waited = true;
    }
}

fn alloc_flagged(
    registry: &HeapRegistry,
    size: usize,
    flags: AllocFlags,
) -> Result<usize, OutOfMemory> {
    let heap = registry.get();
    if let Some(address) = heap.allocate_large(size, flags) {
        return Ok(address);
    }
    registry.wait_for_collection_to_finish();
    heap.allocate_large(size, flags)
        .ok_or(OutOfMemory { requested: size })
}

fn retry_fast(registry: &HeapRegistry, size: usize) -> Option<usize> {
    if registry.uses_thread_alloc_contexts() {
        thread::with_current(|t| t.with_alloc(|ctx| ctx.try_alloc(size)))
    } else {
        registry.shared_alloc_context().try_alloc(size)
    }
}

fn take_sampled(registry: &HeapRegistry, size: usize) -> Option<usize> {
    let sampling = registry.is_sampling_enabled();
    if registry.uses_thread_alloc_contexts() {
        thread::with_current(|t| {
            t.with_alloc(|ctx| {
                if ctx.crosses_sampling_limit(size) {
                    let address = ctx.take_sampled_alloc(size);
                    t.with_rng(|rng| ctx.update_combined_limit(sampling, rng));
                    Some(address)
                } else {
                    None
                }
            })
        })
    } else {
        let ctx = registry.shared_alloc_context();
        if ctx.crosses_sampling_limit(size) {
            let address = ctx.try_alloc_past_sample(size)?;
            thread::with_current(|t| t.with_rng(|rng| ctx.update_combined_limit(sampling, rng)));
            Some(address)
        } else {
            None
        }
    }
}

fn publish_sample(registry: &HeapRegistry, address: usize, size: usize) {
    let published = registry
        .samples()
        .is_some_and(|buffer| buffer.publish(AllocSample { address, size }));
    metrics::boundary_metrics().note_sample(published);
    crate::tracing::internal::log_alloc_sample(address, size);
}

// ============================================================================
// Collection wait
// ============================================================================

/// The collection-wait helper.
///
/// Links a transition frame, blocks until any in-progress collection
/// completes, and reports whether a pending abort is recorded against the
/// thread, whether it was raised before the wait or while the thread was
/// parked. The caller diverts into abort handling on `true`; delivering
/// the abort is the engine's business.
///
/// # Panics
///
/// Panics if the calling thread is not attached to the runtime.
pub fn wait_for_collection(registry: &HeapRegistry) -> bool {
    let shared = current_shared();

    let anchor = 0usize;
    let regs = helper_register_file(&anchor, [0, 0]);
    let mut frame = TransitionFrame::build(shared.id(), &regs);
    if registry.trap_flags().contains(TrapFlags::ABORT_IN_PROGRESS) {
        frame.set_abort_pending();
    }
    {
        let _pushed = PushedFrame::link(&shared, &frame);
        registry.wait_for_collection_to_finish();
    }
    // An abort raised while the thread was parked is reported the same
    // way; the frame is already unlinked, so only the resuming code sees
    // the bit.
    if registry.trap_flags().contains(TrapFlags::ABORT_IN_PROGRESS) {
        frame.set_abort_pending();
    }
    frame.is_abort_pending()
}

// ============================================================================
// Safepoint poll
// ============================================================================

/// Fast safepoint check, inserted by code generators at loop back-edges
/// and call sites.
#[inline]
pub fn safepoint_poll(registry: &HeapRegistry) {
    if registry.trap_flags().contains(TrapFlags::TRAP_THREADS) {
        enter_safepoint(registry);
    }
}

#[cold]
#[inline(never)]
fn enter_safepoint(registry: &HeapRegistry) {
    if let Some(shared) = thread::try_with_current(|t| Arc::clone(t.shared())) {
        // The thread is diverting voluntarily; any outstanding hijack is
        // now redundant and must not fire later against a stale frame.
        hijack::resolve(&shared);

        let anchor = 0usize;
        let regs = helper_register_file(&anchor, [0, 0]);
        let frame = TransitionFrame::build(shared.id(), &regs);
        let _pushed = PushedFrame::link(&shared, &frame);
        registry.wait_for_collection_to_finish();
    } else {
        registry.wait_for_collection_to_finish();
    }
}

// ============================================================================
// Write-barrier tracker entries
// ============================================================================

/// Records a single pointer-sized heap store with the write-watch
/// tracker. Bypasses the tracker entirely while it is disabled.
#[inline]
pub fn record_write(registry: &HeapRegistry, address: usize, write_size: usize) {
    let Some(watch) = registry.write_watch() else {
        return;
    };
    if watch.is_enabled() && registry.globals().in_heap_range(address) {
        watch.set_dirty(address, write_size);
    }
}

/// Records a bulk heap copy with the write-watch tracker.
#[inline]
pub fn record_write_range(registry: &HeapRegistry, address: usize, length: usize) {
    let Some(watch) = registry.write_watch() else {
        return;
    };
    if watch.is_enabled() && registry.globals().in_heap_range(address) {
        watch.set_dirty_range(address, length);
    }
}

// ============================================================================
// Exception helpers
// ============================================================================

fn exception_port(registry: &HeapRegistry) -> &dyn ExceptionPort {
    registry
        .exception_port()
        .expect("no exception port registered")
}

/// The hardware-fault helper: a machine-level fault in managed code is
/// resurfaced as a managed exception.
///
/// # Panics
///
/// Panics if the calling thread is not attached or no exception port is
/// registered.
pub fn throw_hw_exception(registry: &HeapRegistry, code: u32, fault_address: usize) -> ! {
    let shared = current_shared();
    let anchor = 0usize;
    let regs = helper_register_file(&anchor, [code as usize, fault_address]);
    let frame = TransitionFrame::build(shared.id(), &regs);
    let _pushed = PushedFrame::link(&shared, &frame);
    exception_port(registry).raise_hardware_fault(code, fault_address)
}

/// The managed-throw helper. Argument register 0 carries the exception
/// object, so the frame marks it as a reference for the walker.
///
/// # Panics
///
/// Panics if the calling thread is not attached or no exception port is
/// registered.
pub fn throw_managed(registry: &HeapRegistry, exception: usize) -> ! {
    let shared = current_shared();
    let anchor = 0usize;
    let regs = helper_register_file(&anchor, [exception, 0]);
    let mut frame = TransitionFrame::build(shared.id(), &regs);
    frame.mark_arg_gcref(0);
    let _pushed = PushedFrame::link(&shared, &frame);
    exception_port(registry).raise_managed(exception)
}

/// The rethrow helper.
///
/// # Panics
///
/// Panics if the calling thread is not attached or no exception port is
/// registered.
pub fn rethrow(registry: &HeapRegistry) -> ! {
    let shared = current_shared();
    let anchor = 0usize;
    let regs = helper_register_file(&anchor, [0, 0]);
    let frame = TransitionFrame::build(shared.id(), &regs);
    let _pushed = PushedFrame::link(&shared, &frame);
    exception_port(registry).rethrow()
}
