//! Boundary-layer metrics and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-level cumulative counters for the boundary layer.
///
/// Counters are monotonic and updated with relaxed atomics; they are
/// diagnostics, not synchronization.
#[derive(Debug)]
pub struct BoundaryMetrics {
    slow_path_entries: AtomicUsize,
    windows_refilled: AtomicUsize,
    samples_emitted: AtomicUsize,
    samples_dropped: AtomicUsize,
    hijacks_installed: AtomicUsize,
    hijacks_resolved: AtomicUsize,
    collections_waited: AtomicUsize,
}

impl BoundaryMetrics {
    const fn new() -> Self {
        Self {
            slow_path_entries: AtomicUsize::new(0),
            windows_refilled: AtomicUsize::new(0),
            samples_emitted: AtomicUsize::new(0),
            samples_dropped: AtomicUsize::new(0),
            hijacks_installed: AtomicUsize::new(0),
            hijacks_resolved: AtomicUsize::new(0),
            collections_waited: AtomicUsize::new(0),
        }
    }

    pub(crate) fn note_slow_path(&self) {
        self.slow_path_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_window_refilled(&self) {
        self.windows_refilled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_sample(&self, published: bool) {
        if published {
            self.samples_emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.samples_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_hijack_installed(&self) {
        self.hijacks_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_hijack_resolved(&self) {
        self.hijacks_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_collection_waited(&self) {
        self.collections_waited.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of allocation slow-path entries.
    #[must_use]
    pub fn slow_path_entries(&self) -> usize {
        self.slow_path_entries.load(Ordering::Relaxed)
    }

    /// Number of allocation windows handed out.
    #[must_use]
    pub fn windows_refilled(&self) -> usize {
        self.windows_refilled.load(Ordering::Relaxed)
    }

    /// Number of allocation samples published.
    #[must_use]
    pub fn samples_emitted(&self) -> usize {
        self.samples_emitted.load(Ordering::Relaxed)
    }

    /// Number of allocation samples dropped to a full buffer.
    #[must_use]
    pub fn samples_dropped(&self) -> usize {
        self.samples_dropped.load(Ordering::Relaxed)
    }

    /// Number of hijacks installed.
    #[must_use]
    pub fn hijacks_installed(&self) -> usize {
        self.hijacks_installed.load(Ordering::Relaxed)
    }

    /// Number of hijacks resolved (defensive no-op resolves excluded).
    #[must_use]
    pub fn hijacks_resolved(&self) -> usize {
        self.hijacks_resolved.load(Ordering::Relaxed)
    }

    /// Number of times a thread blocked waiting for a collection.
    #[must_use]
    pub fn collections_waited(&self) -> usize {
        self.collections_waited.load(Ordering::Relaxed)
    }
}

static METRICS: BoundaryMetrics = BoundaryMetrics::new();

/// The process-wide boundary-layer counters.
#[must_use]
pub fn boundary_metrics() -> &'static BoundaryMetrics {
    &METRICS
}
