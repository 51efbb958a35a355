//! The heap handle and lifecycle registry.
//!
//! Everything else in the boundary layer queries one process-scoped
//! [`HeapRegistry`]: the write-once pointer to the active heap
//! implementation, the heap-kind and initialization flags, the
//! collector-facing exported values, the write-watch table, and the
//! attached-thread set. The registry owns nothing about how collection
//! works; the collector drives it through the narrow [`CollectedHeap`]
//! interface.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::alloc::{AllocFlags, AllocWindow, SampleBuffer, SharedAllocContext};
use crate::globals::CollectorGlobals;
use crate::helpers::ExceptionPort;
use crate::hijack::TrapFlags;
use crate::metrics;
use crate::sync::{self, LockGuard, LockOrder};
use crate::thread::ThreadRegistry;
use crate::write_watch::WriteWatchTable;

/// Which heap implementation the registry loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Single carve cursor; suits one-processor machines and small
    /// processes.
    Workstation,
    /// Per-processor striped carve cursors for multi-processor machines.
    Server,
}

/// Configuration consulted once, at [`HeapRegistry::load`].
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Forces a heap kind instead of choosing from the processor count.
    pub kind: Option<HeapKind>,
    /// Bytes of address space reserved for the heap.
    pub reserve_bytes: usize,
    /// Default allocation-window size handed to a context on refill.
    pub window_bytes: usize,
    /// Whether randomized allocation sampling starts enabled.
    pub sampling_enabled: bool,
    /// Forces per-thread allocation contexts on or off instead of
    /// choosing from the processor count.
    pub thread_alloc_contexts: Option<bool>,
    /// Capacity of the pending allocation-sample buffer.
    pub sample_buffer_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            kind: None,
            reserve_bytes: 256 * 1024 * 1024,
            window_bytes: 64 * 1024,
            sampling_enabled: false,
            thread_alloc_contexts: None,
            sample_buffer_capacity: 1024,
        }
    }
}

/// Why [`HeapRegistry::load`] failed.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The heap has already been loaded; `load` is a once-only operation.
    #[error("the heap has already been loaded")]
    AlreadyLoaded,
    /// The OS refused the address-space reservation.
    #[error("failed to reserve heap address space")]
    Reserve(#[from] std::io::Error),
}

// ============================================================================
// CollectedHeap - the narrow collector interface
// ============================================================================

/// The registry's view of a heap implementation.
///
/// Collection itself (marking, sweeping, compaction) lives behind this
/// trait in the collector proper. The boundary layer only needs to carve
/// windows, park threads across a collection, and mirror the
/// in-progress state.
pub trait CollectedHeap: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> HeapKind;

    /// Advisory: whether a collection is underway. A collection can start
    /// the instant after this returns false.
    fn is_collection_in_progress(&self) -> bool;

    /// Blocks until any in-progress collection completes.
    fn wait_until_collection_complete(&self);

    /// Collector signal: a collection is starting.
    fn begin_collection(&self);

    /// Collector signal: the collection finished; waiters are released.
    fn end_collection(&self);

    /// Carves a fresh allocation window of at least `min_bytes`.
    /// `None` means the heap is exhausted until a collection reclaims
    /// space.
    fn refill_window(&self, min_bytes: usize) -> Option<AllocWindow>;

    /// Carves space for an object that bypasses the bump window.
    fn allocate_large(&self, size: usize, flags: AllocFlags) -> Option<usize>;

    /// The address range this heap tracks, `[lowest, highest)`.
    fn tracked_range(&self) -> (usize, usize);
}

// ============================================================================
// Collection gate
// ============================================================================

/// Begin/end coordination for collections.
///
/// `in_progress` mirrors the gate state for lock-free advisory reads; the
/// mutex and condvar serialize the begin/end edges and park waiters.
struct CollectionGate {
    in_progress: AtomicBool,
    state: Mutex<bool>,
    finished: Condvar,
}

impl CollectionGate {
    const fn new() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            state: Mutex::new(false),
            finished: Condvar::new(),
        }
    }

    fn begin(&self) {
        let _order = LockGuard::new(LockOrder::CollectionGate);
        let mut state = self.state.lock();
        debug_assert!(!*state, "collection begun while one is in progress");
        *state = true;
        self.in_progress.store(true, Ordering::Release);
    }

    fn end(&self) {
        let _order = LockGuard::new(LockOrder::CollectionGate);
        let mut state = self.state.lock();
        *state = false;
        self.in_progress.store(false, Ordering::Release);
        self.finished.notify_all();
    }

    fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn wait(&self) {
        sync::assert_no_locks_held("wait for collection");
        let mut state = self.state.lock();
        while *state {
            self.finished.wait(&mut state);
        }
    }
}

// ============================================================================
// Heap implementations
// ============================================================================

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn carve_from(cursor: &mut usize, end: usize, bytes: usize, flags: AllocFlags) -> Option<usize> {
    let mut base = align_up(*cursor, std::mem::size_of::<usize>());
    if flags.intersects(AllocFlags::ALIGN8 | AllocFlags::ALIGN8_BIAS) {
        base = align_up(base, 8);
        if flags.contains(AllocFlags::ALIGN8_BIAS) {
            base += 4;
        }
    }
    let new_cursor = base.checked_add(bytes)?;
    if new_cursor > end {
        return None;
    }
    *cursor = new_cursor;
    Some(base)
}

/// Workstation heap: the whole reservation behind one carve cursor.
struct WorkstationHeap {
    reservation: sys_vm::Reservation,
    window_bytes: usize,
    cursor: Mutex<usize>,
    gate: CollectionGate,
}

impl WorkstationHeap {
    fn new(reservation: sys_vm::Reservation, window_bytes: usize) -> Self {
        let cursor = reservation.base();
        Self {
            reservation,
            window_bytes,
            cursor: Mutex::new(cursor),
            gate: CollectionGate::new(),
        }
    }

    fn carve(&self, bytes: usize, flags: AllocFlags) -> Option<usize> {
        let _order = LockGuard::new(LockOrder::WindowCarve);
        let mut cursor = self.cursor.lock();
        carve_from(&mut cursor, self.reservation.end(), bytes, flags)
    }
}

impl CollectedHeap for WorkstationHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Workstation
    }

    fn is_collection_in_progress(&self) -> bool {
        self.gate.is_in_progress()
    }

    fn wait_until_collection_complete(&self) {
        self.gate.wait();
    }

    fn begin_collection(&self) {
        self.gate.begin();
    }

    fn end_collection(&self) {
        self.gate.end();
    }

    fn refill_window(&self, min_bytes: usize) -> Option<AllocWindow> {
        let bytes = min_bytes.max(self.window_bytes);
        let base = self.carve(bytes, AllocFlags::empty())?;
        Some(AllocWindow::new(base, base + bytes))
    }

    fn allocate_large(&self, size: usize, flags: AllocFlags) -> Option<usize> {
        self.carve(size, flags)
    }

    fn tracked_range(&self) -> (usize, usize) {
        (self.reservation.base(), self.reservation.end())
    }
}

/// One per-processor carve region of the server heap.
struct Stripe {
    cursor: Mutex<usize>,
    end: usize,
}

/// Server heap: the reservation split into per-processor stripes so
/// window refills on different processors rarely contend.
struct ServerHeap {
    reservation: sys_vm::Reservation,
    window_bytes: usize,
    stripes: Vec<Stripe>,
    next_stripe: AtomicUsize,
    gate: CollectionGate,
}

impl ServerHeap {
    fn new(reservation: sys_vm::Reservation, window_bytes: usize, stripe_count: usize) -> Self {
        let stripe_count = stripe_count.max(1);
        let stripe_len = reservation.len() / stripe_count;
        let stripes = (0..stripe_count)
            .map(|i| {
                let base = reservation.base() + i * stripe_len;
                let end = if i + 1 == stripe_count {
                    reservation.end()
                } else {
                    base + stripe_len
                };
                Stripe {
                    cursor: Mutex::new(base),
                    end,
                }
            })
            .collect();
        Self {
            reservation,
            window_bytes,
            stripes,
            next_stripe: AtomicUsize::new(0),
            gate: CollectionGate::new(),
        }
    }

    /// Carves from the preferred stripe, falling over to the others when
    /// it is exhausted.
    fn carve(&self, bytes: usize, flags: AllocFlags) -> Option<usize> {
        let preferred = self.next_stripe.fetch_add(1, Ordering::Relaxed) % self.stripes.len();
        let _order = LockGuard::new(LockOrder::WindowCarve);
        for offset in 0..self.stripes.len() {
            let stripe = &self.stripes[(preferred + offset) % self.stripes.len()];
            let mut cursor = stripe.cursor.lock();
            if let Some(base) = carve_from(&mut cursor, stripe.end, bytes, flags) {
                return Some(base);
            }
        }
        None
    }
}

impl CollectedHeap for ServerHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Server
    }

    fn is_collection_in_progress(&self) -> bool {
        self.gate.is_in_progress()
    }

    fn wait_until_collection_complete(&self) {
        self.gate.wait();
    }

    fn begin_collection(&self) {
        self.gate.begin();
    }

    fn end_collection(&self) {
        self.gate.end();
    }

    fn refill_window(&self, min_bytes: usize) -> Option<AllocWindow> {
        let bytes = min_bytes.max(self.window_bytes);
        let base = self.carve(bytes, AllocFlags::empty())?;
        Some(AllocWindow::new(base, base + bytes))
    }

    fn allocate_large(&self, size: usize, flags: AllocFlags) -> Option<usize> {
        self.carve(size, flags)
    }

    fn tracked_range(&self) -> (usize, usize) {
        (self.reservation.base(), self.reservation.end())
    }
}

// ============================================================================
// HeapRegistry
// ============================================================================

/// Process-scoped singleton state of the boundary layer.
///
/// Write-once: [`load`](Self::load) constructs the heap exactly once
/// before any reader observes the registry as initialized; afterwards the
/// singleton is read without synchronization.
pub struct HeapRegistry {
    heap: OnceLock<Box<dyn CollectedHeap>>,
    use_thread_alloc_contexts: AtomicBool,
    sampling_enabled: AtomicBool,
    globals: CollectorGlobals,
    write_watch: OnceLock<WriteWatchTable>,
    shared_alloc: SharedAllocContext,
    samples: OnceLock<SampleBuffer>,
    trap: AtomicU32,
    threads: ThreadRegistry,
    exception_port: OnceLock<Box<dyn ExceptionPort>>,
}

impl HeapRegistry {
    /// Creates an unloaded registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: OnceLock::new(),
            use_thread_alloc_contexts: AtomicBool::new(true),
            sampling_enabled: AtomicBool::new(false),
            globals: CollectorGlobals::new(),
            write_watch: OnceLock::new(),
            shared_alloc: SharedAllocContext::new(),
            samples: OnceLock::new(),
            trap: AtomicU32::new(0),
            threads: ThreadRegistry::new(),
            exception_port: OnceLock::new(),
        }
    }

    /// Performs the one-time heap construction and selection.
    ///
    /// The kind comes from the config override, otherwise from the
    /// processor count: multi-processor machines get the striped server
    /// heap. Reserves the heap address range, builds the write-watch
    /// table over it, and publishes the collector-facing globals.
    ///
    /// Designed to be called exactly once, early; the `AlreadyLoaded`
    /// check is best-effort, not a synchronization point for racing
    /// loaders.
    ///
    /// # Errors
    ///
    /// [`LoadError::AlreadyLoaded`] on a second call;
    /// [`LoadError::Reserve`] when the OS refuses the address space.
    pub fn load(&self, config: &HeapConfig) -> Result<HeapKind, LoadError> {
        if self.is_initialized() {
            return Err(LoadError::AlreadyLoaded);
        }

        let processors = num_cpus::get();
        let kind = config.kind.unwrap_or(if processors > 1 {
            HeapKind::Server
        } else {
            HeapKind::Workstation
        });

        let reservation = sys_vm::ReserveOptions::new(config.reserve_bytes)
            .no_swap_reserve(true)
            .reserve()?;
        let (lowest, highest) = (reservation.base(), reservation.end());

        let heap: Box<dyn CollectedHeap> = match kind {
            HeapKind::Workstation => Box::new(WorkstationHeap::new(reservation, config.window_bytes)),
            HeapKind::Server => Box::new(ServerHeap::new(
                reservation,
                config.window_bytes,
                processors,
            )),
        };

        let watch = WriteWatchTable::new(lowest, highest);
        self.globals.publish_heap_range(lowest, highest);
        // Until a collection establishes generations, everything is
        // ephemeral.
        self.globals.publish_ephemeral_range(lowest, highest);
        self.globals.publish_write_watch_table(watch.table_base());
        let _ = self.write_watch.set(watch);
        let _ = self
            .samples
            .set(SampleBuffer::new(config.sample_buffer_capacity));

        self.use_thread_alloc_contexts.store(
            config.thread_alloc_contexts.unwrap_or(processors > 1),
            Ordering::Release,
        );
        self.sampling_enabled
            .store(config.sampling_enabled, Ordering::Release);

        if self.heap.set(heap).is_err() {
            return Err(LoadError::AlreadyLoaded);
        }
        crate::tracing::internal::log_heap_loaded(
            match kind {
                HeapKind::Workstation => "workstation",
                HeapKind::Server => "server",
            },
            lowest,
            highest,
        );
        Ok(kind)
    }

    /// Whether the singleton has been constructed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.get().is_some()
    }

    /// The active heap.
    ///
    /// Requires [`is_initialized`](Self::is_initialized); access before
    /// `load` is a contract violation, not a recoverable condition.
    ///
    /// # Panics
    ///
    /// Panics when the registry is not initialized.
    #[must_use]
    pub fn get(&self) -> &dyn CollectedHeap {
        debug_assert!(self.is_initialized(), "heap accessed before load");
        self.heap
            .get()
            .expect("heap accessed before load")
            .as_ref()
    }

    /// The active heap, or `None` before `load`.
    #[must_use]
    pub fn try_get(&self) -> Option<&dyn CollectedHeap> {
        self.heap.get().map(AsRef::as_ref)
    }

    /// Advisory mirror of the heap's collection state; false before
    /// `load`. A collection can start immediately after this returns.
    #[must_use]
    pub fn is_collection_in_progress(&self) -> bool {
        self.try_get().is_some_and(CollectedHeap::is_collection_in_progress)
    }

    /// Blocks the caller until any in-progress collection completes.
    /// No-op when the registry is not yet initialized. Callers must hold
    /// no locks across this.
    pub fn wait_for_collection_to_finish(&self) {
        if let Some(heap) = self.try_get() {
            crate::tracing::internal::log_wait_for_collection(crate::thread::current_id());
            metrics::boundary_metrics().note_collection_waited();
            heap.wait_until_collection_complete();
        }
    }

    /// Whether threads get private allocation contexts. False on
    /// single-processor configurations, where all threads share
    /// [`shared_alloc_context`](Self::shared_alloc_context).
    #[must_use]
    pub fn uses_thread_alloc_contexts(&self) -> bool {
        self.use_thread_alloc_contexts.load(Ordering::Acquire)
    }

    /// The collector-facing exported values.
    #[must_use]
    pub const fn globals(&self) -> &CollectorGlobals {
        &self.globals
    }

    /// The write-watch table, once loaded.
    #[must_use]
    pub fn write_watch(&self) -> Option<&WriteWatchTable> {
        self.write_watch.get()
    }

    /// The process-wide shared allocation context.
    #[must_use]
    pub const fn shared_alloc_context(&self) -> &SharedAllocContext {
        &self.shared_alloc
    }

    /// Whether randomized allocation sampling is enabled.
    #[must_use]
    pub fn is_sampling_enabled(&self) -> bool {
        self.sampling_enabled.load(Ordering::Relaxed)
    }

    /// Turns randomized allocation sampling on or off. Contexts pick the
    /// change up at their next refill or sampling trap.
    pub fn set_sampling_enabled(&self, enabled: bool) {
        self.sampling_enabled.store(enabled, Ordering::Relaxed);
    }

    /// The pending allocation-sample buffer, once loaded.
    #[must_use]
    pub fn samples(&self) -> Option<&SampleBuffer> {
        self.samples.get()
    }

    /// Current process-wide trap flags.
    #[must_use]
    pub fn trap_flags(&self) -> TrapFlags {
        TrapFlags::from_bits_truncate(self.trap.load(Ordering::Acquire))
    }

    /// Raises trap flags for all threads to observe at their next poll.
    pub fn request_trap(&self, flags: TrapFlags) {
        self.trap.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears trap flags.
    pub fn clear_trap(&self, flags: TrapFlags) {
        self.trap.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// The attached-thread set.
    #[must_use]
    pub const fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Registers the execution engine's exception dispatch. Write-once;
    /// later calls are ignored.
    pub fn set_exception_port(&self, port: Box<dyn ExceptionPort>) {
        let _ = self.exception_port.set(port);
    }

    /// The registered exception dispatch, if any.
    #[must_use]
    pub fn exception_port(&self) -> Option<&dyn ExceptionPort> {
        self.exception_port.get().map(AsRef::as_ref)
    }
}

impl Default for HeapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegistry")
            .field("initialized", &self.is_initialized())
            .field("kind", &self.try_get().map(CollectedHeap::kind))
            .finish_non_exhaustive()
    }
}
