//! Per-thread runtime state and the current-thread lookup slot.
//!
//! Every managed thread carries two halves of state. The thread-exclusive
//! half (allocation context, sampling RNG) lives in thread-local storage
//! and is never touched by another thread. The shared half
//! ([`SharedThreadState`]: safepoint flags, hijack record, topmost
//! transition frame, stack bounds) is reachable by the collector through
//! the process-wide [`ThreadRegistry`], and every field on it is atomic.
//!
//! Unmanaged helpers locate their owning thread through the thread-local
//! slot, [`with_current`], without taking any lock.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::alloc::AllocContext;
use crate::frame::TransitionFrame;
use crate::hijack::HijackRecord;

bitflags! {
    /// Per-thread safepoint eligibility flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SafepointFlags: u32 {
        /// The thread is attached to the runtime.
        const ATTACHED = 0x01;
        /// GC stress-mode redirection is suppressed for this thread.
        const SUPPRESS_GC_STRESS = 0x08;
        /// The thread must not be made to trigger or service a
        /// collection. While set, the thread is not eligible for
        /// hijack-based redirection.
        const DO_NOT_TRIGGER_GC = 0x10;
    }
}

// ============================================================================
// Stack bounds
// ============================================================================

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    /// Lowest stack address.
    pub low: usize,
    /// Highest stack address.
    pub high: usize,
}

impl StackBounds {
    /// Bounds that admit any address, for platforms where the real bounds
    /// cannot be queried.
    pub const UNKNOWN: Self = Self {
        low: 0,
        high: usize::MAX,
    };

    /// Whether `addr` lies within the stack.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
#[must_use]
pub fn current_stack_bounds() -> StackBounds {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        let ret = pthread_getattr_np(pthread_self(), &raw mut attr);
        assert!(ret == 0, "pthread_getattr_np failed");

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        if ret != 0 {
            pthread_attr_destroy(&raw mut attr);
            panic!("pthread_attr_getstack failed");
        }
        pthread_attr_destroy(&raw mut attr);

        StackBounds {
            low: stackaddr as usize,
            high: (stackaddr as usize) + stacksize,
        }
    }
}

/// Retrieve the stack bounds for the current thread (fallback).
#[cfg(not(all(target_os = "linux", not(miri))))]
#[must_use]
pub fn current_stack_bounds() -> StackBounds {
    StackBounds::UNKNOWN
}

// ============================================================================
// SharedThreadState
// ============================================================================

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// The collector-visible half of a thread's state.
pub struct SharedThreadState {
    id: u64,
    flags: AtomicU32,
    hijack: HijackRecord,
    top_frame: AtomicPtr<TransitionFrame>,
    stack: StackBounds,
}

impl SharedThreadState {
    fn new(stack: StackBounds) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            flags: AtomicU32::new(SafepointFlags::ATTACHED.bits()),
            hijack: HijackRecord::new(),
            top_frame: AtomicPtr::new(ptr::null_mut()),
            stack,
        })
    }

    /// A detached state for harness code that needs a target thread
    /// without spawning one.
    #[cfg(any(test, feature = "test-util"))]
    #[doc(hidden)]
    #[must_use]
    pub fn for_tests() -> Arc<Self> {
        Self::new(StackBounds::UNKNOWN)
    }

    /// Runtime-wide unique thread identity.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current safepoint flags.
    #[must_use]
    pub fn flags(&self) -> SafepointFlags {
        SafepointFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Sets the given flag bits.
    pub fn set_flags(&self, flags: SafepointFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears the given flag bits.
    pub fn clear_flags(&self, flags: SafepointFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the thread may currently be redirected by hijacking.
    ///
    /// The flag check is the sole synchronization primitive protecting
    /// hijack installation: a thread that sets `DO_NOT_TRIGGER_GC` before
    /// entering a region is guaranteed not to acquire a hijack inside it.
    #[must_use]
    pub fn is_hijack_eligible(&self) -> bool {
        !self
            .flags()
            .intersects(SafepointFlags::DO_NOT_TRIGGER_GC | SafepointFlags::SUPPRESS_GC_STRESS)
    }

    /// The thread's hijack record.
    #[must_use]
    pub const fn hijack(&self) -> &HijackRecord {
        &self.hijack
    }

    /// The thread's topmost transition frame slot. Null when no
    /// unmanaged helper is active.
    #[must_use]
    pub const fn top_frame(&self) -> &AtomicPtr<TransitionFrame> {
        &self.top_frame
    }

    /// The walker's entry point for this thread: the topmost linked
    /// transition frame, if any.
    #[must_use]
    pub fn top_transition_frame(&self) -> Option<ptr::NonNull<TransitionFrame>> {
        ptr::NonNull::new(self.top_frame.load(Ordering::Acquire))
    }

    /// The thread's stack bounds.
    #[must_use]
    pub const fn stack_bounds(&self) -> StackBounds {
        self.stack
    }
}

impl std::fmt::Debug for SharedThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedThreadState")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ThreadRegistry
// ============================================================================

/// The set of threads currently attached to the runtime.
///
/// The collector enumerates it to suspend, walk, or hijack threads; the
/// lock guards only the vector, never any per-thread state.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<SharedThreadState>>>,
}

impl ThreadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, thread: Arc<SharedThreadState>) {
        self.threads.lock().push(thread);
    }

    fn unregister(&self, id: u64) {
        self.threads.lock().retain(|t| t.id() != id);
    }

    /// Number of attached threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether no threads are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Calls `f` for every attached thread.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<SharedThreadState>)) {
        for thread in self.threads.lock().iter() {
            f(thread);
        }
    }

    /// Looks up an attached thread by id.
    #[must_use]
    pub fn find(&self, id: u64) -> Option<Arc<SharedThreadState>> {
        self.threads.lock().iter().find(|t| t.id() == id).cloned()
    }
}

// ============================================================================
// Thread-local current-thread slot
// ============================================================================

/// The thread-exclusive half of a thread's state.
pub struct ThreadState {
    shared: Arc<SharedThreadState>,
    alloc: RefCell<AllocContext>,
    rng: RefCell<SmallRng>,
}

impl ThreadState {
    /// The collector-visible half.
    #[must_use]
    pub const fn shared(&self) -> &Arc<SharedThreadState> {
        &self.shared
    }

    /// Runs `f` with exclusive access to the thread's allocation context.
    pub fn with_alloc<R>(&self, f: impl FnOnce(&mut AllocContext) -> R) -> R {
        f(&mut self.alloc.borrow_mut())
    }

    /// Runs `f` with the thread's sampling RNG.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut SmallRng) -> R) -> R {
        f(&mut self.rng.borrow_mut())
    }
}

thread_local! {
    /// The fixed, pre-resolved slot through which unmanaged helpers find
    /// their owning thread.
    static CURRENT: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

/// Attaches the calling thread to the runtime.
///
/// Idempotent: attaching an already-attached thread returns its existing
/// state. The thread starts with a null allocation window and the
/// `ATTACHED` flag set.
pub fn attach_current(registry: &ThreadRegistry) -> Arc<SharedThreadState> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if let Some(state) = current.as_ref() {
            return Arc::clone(state.shared());
        }
        let shared = SharedThreadState::new(current_stack_bounds());
        registry.register(Arc::clone(&shared));
        *current = Some(ThreadState {
            shared: Arc::clone(&shared),
            alloc: RefCell::new(AllocContext::new()),
            rng: RefCell::new(SmallRng::from_entropy()),
        });
        shared
    })
}

/// Detaches the calling thread from the runtime.
///
/// Any unreturned allocation window is abandoned to the heap; the shared
/// state stays alive as long as the collector holds a reference but is no
/// longer enumerable.
pub fn detach_current(registry: &ThreadRegistry) {
    CURRENT.with(|current| {
        if let Some(state) = current.borrow_mut().take() {
            state.shared().clear_flags(SafepointFlags::ATTACHED);
            registry.unregister(state.shared().id());
        }
    });
}

/// Whether the calling thread is attached.
#[must_use]
pub fn is_attached() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// Runs `f` with the calling thread's state.
///
/// # Panics
///
/// Panics if the thread is not attached; calling a managed helper from
/// an unattached thread is a caller contract violation.
pub fn with_current<R>(f: impl FnOnce(&ThreadState) -> R) -> R {
    CURRENT.with(|current| {
        let current = current.borrow();
        let state = current
            .as_ref()
            .expect("current thread is not attached to the runtime");
        f(state)
    })
}

/// Runs `f` with the calling thread's state, or returns `None` when
/// unattached.
pub fn try_with_current<R>(f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
    CURRENT.with(|current| current.borrow().as_ref().map(f))
}

/// The calling thread's runtime id, if attached.
#[must_use]
pub fn current_id() -> Option<u64> {
    try_with_current(|state| state.shared().id())
}
