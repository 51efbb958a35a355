//! Bump-pointer allocation contexts with randomized allocation sampling.
//!
//! Running code carves objects out of a pre-reserved window by advancing a
//! pointer; the fast path is one compare and one add. A profiling feature
//! overlays a *sampling limit* on the window: after a randomized number of
//! bytes the fast path is forced into the slow path, which reports the
//! allocation as a sample and draws a fresh threshold.
//!
//! The sampling limit is never stored separately. The fast path compares
//! against `combined_limit`, the minimum of the window end and the
//! sampling limit:
//!
//! - `combined_limit == alloc_limit`: no sampled byte in this window,
//!   either because sampling is disabled or because the random draw landed
//!   past the window end.
//! - `combined_limit < alloc_limit`: the sampling limit is
//!   `combined_limit` itself. `combined_limit - alloc_ptr` is the budget
//!   of bytes that may still be allocated unsampled.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use rand::Rng;

use bitflags::bitflags;

/// Mean of the sampling distribution, in bytes.
///
/// Over many allocations a sample fires roughly once per this many bytes,
/// independent of individual object sizes.
pub const SAMPLING_MEAN_BYTES: usize = 100 * 1024;

bitflags! {
    /// Allocation-kind flags carried into the slow path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The object needs finalization; it must be registered with the
        /// collector and cannot come from the fast path.
        const FINALIZE = 1;
        /// The object's payload needs 8-byte alignment with a 4-byte
        /// biased header.
        const ALIGN8_BIAS = 4;
        /// The object needs 8-byte alignment.
        const ALIGN8 = 8;
    }
}

/// Draws one sampling threshold from the geometric distribution with mean
/// [`SAMPLING_MEAN_BYTES`], via the inverse CDF of the exponential.
///
/// The memoryless draw is what keeps sampling unbiased with respect to
/// object size: the probability that any given allocated byte is the
/// sampled one is constant. A threshold of zero is legal and fires on the
/// next allocation.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn geometric_sample(rng: &mut impl Rng) -> usize {
    let probability: f64 = rng.gen();
    (-(1.0 - probability).ln() * SAMPLING_MEAN_BYTES as f64) as usize
}

// ============================================================================
// AllocWindow
// ============================================================================

/// A contiguous span of pre-reserved memory handed to an allocation
/// context by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocWindow {
    /// First usable address.
    pub base: usize,
    /// One past the last usable address.
    pub limit: usize,
}

impl AllocWindow {
    /// The null window; every allocation against it takes the slow path.
    pub const EMPTY: Self = Self { base: 0, limit: 0 };

    /// Creates a window over `[base, limit)`.
    #[must_use]
    pub const fn new(base: usize, limit: usize) -> Self {
        assert!(base <= limit, "inverted allocation window");
        Self { base, limit }
    }

    /// Window length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.limit - self.base
    }

    /// Whether the window has no usable bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.base == self.limit
    }
}

// ============================================================================
// AllocContext - thread-exclusive bump window
// ============================================================================

/// A thread-exclusive bump-allocation window.
///
/// Invariant: `alloc_ptr <= combined_limit <= alloc_limit` whenever the
/// context holds a window, and `combined_limit == alloc_limit` whenever
/// sampling is disabled.
#[derive(Debug, Clone, Copy)]
pub struct AllocContext {
    alloc_ptr: usize,
    alloc_limit: usize,
    combined_limit: usize,
}

impl AllocContext {
    /// Creates a context with the null window.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alloc_ptr: 0,
            alloc_limit: 0,
            combined_limit: 0,
        }
    }

    /// Resets the context to the null window.
    pub const fn init(&mut self) {
        self.alloc_ptr = 0;
        self.alloc_limit = 0;
        self.combined_limit = 0;
    }

    /// Fast-path allocation.
    ///
    /// On success, bumps the pointer and returns the address of the carved
    /// span. `None` means "slow path required" (the window is exhausted
    /// or the allocation would overlap the sampling limit) and leaves the
    /// context untouched.
    #[inline]
    pub const fn try_alloc(&mut self, size: usize) -> Option<usize> {
        let ptr = self.alloc_ptr;
        let Some(end) = ptr.checked_add(size) else {
            return None;
        };
        if end > self.combined_limit {
            return None;
        }
        self.alloc_ptr = end;
        Some(ptr)
    }

    /// Replaces the window wholesale and recomputes the combined limit.
    ///
    /// Called only by the owner of the allocation slow path, with a window
    /// freshly carved by the heap.
    pub fn refill(&mut self, window: AllocWindow, sampling_enabled: bool, rng: &mut impl Rng) {
        self.alloc_ptr = window.base;
        self.alloc_limit = window.limit;
        self.update_combined_limit(sampling_enabled, rng);
    }

    /// Recomputes the combined limit from the current pointer.
    ///
    /// With sampling disabled the combined limit is the window end. With
    /// sampling enabled, one geometric draw places the next sampled byte;
    /// if it lands past the window end, no sample fires in this window and
    /// a fresh draw happens at the next refill.
    pub fn update_combined_limit(&mut self, sampling_enabled: bool, rng: &mut impl Rng) {
        if sampling_enabled {
            let candidate = self.alloc_ptr.saturating_add(geometric_sample(rng));
            self.combined_limit = candidate.min(self.alloc_limit);
        } else {
            self.combined_limit = self.alloc_limit;
        }
    }

    /// Whether an allocation of `size` fits the real window but overlaps
    /// the sampling limit, the condition for a sampling trap rather than
    /// a refill.
    #[inline]
    #[must_use]
    pub const fn crosses_sampling_limit(&self, size: usize) -> bool {
        let Some(end) = self.alloc_ptr.checked_add(size) else {
            return false;
        };
        end > self.combined_limit && end <= self.alloc_limit
    }

    /// Takes an allocation that overlaps the sampled byte.
    ///
    /// The caller has already established [`crosses_sampling_limit`]; the
    /// bump proceeds against the real window end and the caller must
    /// recompute the combined limit afterwards.
    ///
    /// [`crosses_sampling_limit`]: Self::crosses_sampling_limit
    pub const fn take_sampled_alloc(&mut self, size: usize) -> usize {
        debug_assert!(self.crosses_sampling_limit(size));
        let ptr = self.alloc_ptr;
        self.alloc_ptr = ptr + size;
        ptr
    }

    /// Current bump pointer.
    #[must_use]
    pub const fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    /// End of the current window.
    #[must_use]
    pub const fn alloc_limit(&self) -> usize {
        self.alloc_limit
    }

    /// Effective fast-path ceiling: `min(alloc_limit, sampling limit)`.
    #[must_use]
    pub const fn combined_limit(&self) -> usize {
        self.combined_limit
    }
}

impl Default for AllocContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SharedAllocContext - single-processor shared window
// ============================================================================

/// The process-wide allocation context used when per-thread contexts are
/// disabled (single-processor configurations).
///
/// Two threads may race to claim the same fast-path slot, so the bump is a
/// compare-and-swap. The bump pointer sits on its own cache line; the
/// limits are read-mostly.
pub struct SharedAllocContext {
    alloc_ptr: CachePadded<AtomicUsize>,
    alloc_limit: AtomicUsize,
    combined_limit: AtomicUsize,
    refill_lock: Mutex<()>,
}

impl SharedAllocContext {
    /// Creates a shared context with the null window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            alloc_ptr: CachePadded::new(AtomicUsize::new(0)),
            alloc_limit: AtomicUsize::new(0),
            combined_limit: AtomicUsize::new(0),
            refill_lock: Mutex::new(()),
        }
    }

    /// Fast-path allocation; the shared-window analogue of
    /// [`AllocContext::try_alloc`].
    #[inline]
    pub fn try_alloc(&self, size: usize) -> Option<usize> {
        let mut ptr = self.alloc_ptr.load(Ordering::Relaxed);
        loop {
            let end = ptr.checked_add(size)?;
            if end > self.combined_limit.load(Ordering::Acquire) {
                return None;
            }
            match self
                .alloc_ptr
                .compare_exchange_weak(ptr, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(ptr),
                Err(current) => ptr = current,
            }
        }
    }

    /// Claims an allocation that overlaps the sampled byte, bumping
    /// against the real window end. Returns `None` if the window cannot
    /// hold it (a racer moved the pointer).
    pub fn try_alloc_past_sample(&self, size: usize) -> Option<usize> {
        let mut ptr = self.alloc_ptr.load(Ordering::Relaxed);
        loop {
            let end = ptr.checked_add(size)?;
            if end > self.alloc_limit.load(Ordering::Acquire) {
                return None;
            }
            match self
                .alloc_ptr
                .compare_exchange_weak(ptr, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(ptr),
                Err(current) => ptr = current,
            }
        }
    }

    /// Replaces the window wholesale and recomputes the combined limit.
    ///
    /// Refills serialize on an internal lock so the three fields always
    /// describe one window; a racing refiller abandons the loser's window
    /// to the heap. Racing fast paths observe a zero combined limit
    /// mid-refill, fail, and fall into the slow path behind the refiller.
    /// The lock is a leaf: nothing is acquired or awaited under it.
    pub fn refill(&self, window: AllocWindow, sampling_enabled: bool, rng: &mut impl Rng) {
        let _refill = self.refill_lock.lock();
        self.combined_limit.store(0, Ordering::Release);
        self.alloc_limit.store(window.limit, Ordering::Relaxed);
        self.alloc_ptr.store(window.base, Ordering::Relaxed);
        self.update_combined_limit(sampling_enabled, rng);
    }

    /// Recomputes the combined limit from the current pointer.
    ///
    /// Concurrent recomputations can land a threshold slightly late; the
    /// consequence is a missed sample, which the sampling design
    /// tolerates.
    pub fn update_combined_limit(&self, sampling_enabled: bool, rng: &mut impl Rng) {
        let limit = self.alloc_limit.load(Ordering::Relaxed);
        let combined = if sampling_enabled {
            let ptr = self.alloc_ptr.load(Ordering::Relaxed);
            ptr.saturating_add(geometric_sample(rng)).min(limit)
        } else {
            limit
        };
        self.combined_limit.store(combined, Ordering::Release);
    }

    /// Whether an allocation of `size` would overlap the sampling limit
    /// while still fitting the window. Advisory under concurrency.
    #[must_use]
    pub fn crosses_sampling_limit(&self, size: usize) -> bool {
        let ptr = self.alloc_ptr.load(Ordering::Relaxed);
        let Some(end) = ptr.checked_add(size) else {
            return false;
        };
        end > self.combined_limit.load(Ordering::Relaxed)
            && end <= self.alloc_limit.load(Ordering::Relaxed)
    }

    /// A point-in-time copy of the window state, for diagnostics and
    /// tests.
    #[must_use]
    pub fn snapshot(&self) -> AllocContext {
        AllocContext {
            alloc_ptr: self.alloc_ptr.load(Ordering::Relaxed),
            alloc_limit: self.alloc_limit.load(Ordering::Relaxed),
            combined_limit: self.combined_limit.load(Ordering::Relaxed),
        }
    }
}

impl Default for SharedAllocContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedAllocContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

// ============================================================================
// Allocation samples
// ============================================================================

/// One sampled allocation, reported when the fast path trips over the
/// sampling limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSample {
    /// Address of the sampled allocation.
    pub address: usize,
    /// Size of the sampled allocation in bytes.
    pub size: usize,
}

/// Bounded buffer of pending allocation samples.
///
/// Profiling consumers drain it at their own pace; when it overflows the
/// sample is dropped and counted rather than blocking the allocator.
pub struct SampleBuffer {
    queue: ArrayQueue<AllocSample>,
}

impl SampleBuffer {
    /// Creates a buffer holding at most `capacity` pending samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Publishes a sample. Returns `false` if the buffer was full and the
    /// sample was dropped.
    pub fn publish(&self, sample: AllocSample) -> bool {
        self.queue.push(sample).is_ok()
    }

    /// Removes and returns the oldest pending sample.
    pub fn pop(&self) -> Option<AllocSample> {
        self.queue.pop()
    }

    /// Number of samples currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no samples are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("pending", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}
