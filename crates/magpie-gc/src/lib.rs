//! The execution-engine/GC boundary layer of the magpie runtime.
//!
//! `magpie-gc` is the seam between running managed code and the garbage
//! collector. It hands out fast-path allocation windows, tracks which
//! heap pages were written since the last collection pass, and lets the
//! collector suspend, inspect, and redirect a thread that is deep inside
//! unmanaged helper code with no cooperative checkpoint of its own.
//!
//! # Components
//!
//! - **[`registry`]**: the process-scoped [`HeapRegistry`] holding the
//!   write-once heap singleton, collection gate, and collector-facing
//!   globals.
//! - **[`alloc`]**: bump-pointer [`AllocContext`]s whose effective limit
//!   folds in a randomized sampling boundary, plus the shared
//!   compare-and-swap variant for single-processor configurations.
//! - **[`write_watch`]**: the byte-per-page [`WriteWatchTable`] the
//!   collector consults to skip unmodified regions.
//! - **[`frame`]**: [`TransitionFrame`]s, the record an unmanaged helper
//!   builds so a collection triggered mid-helper can still walk the
//!   stack from the helper's caller.
//! - **[`hijack`]**: return-address substitution that diverts an
//!   uncooperative thread into a safepoint on its next return.
//! - **[`helpers`]**: the entry points code generators emit calls to,
//!   covering allocation, collection wait, exception raising, and
//!   safepoint polls.
//!
//! # Quick start
//!
//! ```
//! use magpie_gc::{allocate, attach_current, AllocFlags, HeapConfig, HeapRegistry};
//!
//! let registry = HeapRegistry::new();
//! registry.load(&HeapConfig::default()).unwrap();
//! attach_current(registry.threads());
//!
//! let address = allocate(&registry, 64, AllocFlags::empty()).unwrap();
//! assert!(registry.globals().in_heap_range(address));
//! ```
//!
//! # Hazards
//!
//! Everything here sits on the allocation fast path or inside the
//! stop-the-world window, and failures are silent heap corruption rather
//! than exceptions. The fast path never blocks and never takes a lock;
//! contract violations are debug assertions, not recoverable errors; and
//! the benign races (write-watch stores, late sampling thresholds) are
//! benign precisely because their consequences are conservative only.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
pub mod frame;
pub mod globals;
pub mod helpers;
pub mod hijack;
pub mod metrics;
pub mod registry;
pub mod sync;
pub mod thread;
pub mod write_watch;

mod tracing;

// Re-export public API
pub use alloc::{
    AllocContext, AllocFlags, AllocSample, AllocWindow, SharedAllocContext, SAMPLING_MEAN_BYTES,
};
pub use frame::{
    FrameFlags, PreservedReg, PushedFrame, RegisterFile, TransitionFrame,
    DEFAULT_FRAME_SAVE_FLAGS,
};
pub use helpers::{
    allocate, rethrow, safepoint_poll, throw_hw_exception, throw_managed, wait_for_collection,
    ExceptionPort, OutOfMemory,
};
pub use hijack::{install, resolve, HijackError, HijackTarget, ReturnAddressSlot, TrapFlags};
pub use metrics::{boundary_metrics, BoundaryMetrics};
pub use registry::{CollectedHeap, HeapConfig, HeapKind, HeapRegistry, LoadError};
pub use thread::{attach_current, detach_current, with_current, SafepointFlags, SharedThreadState};
pub use write_watch::{WriteWatchTable, PAGE_SHIFT, PAGE_SIZE};
