//! Structured tracing support.
//!
//! When the `tracing` feature is enabled, this module emits events for
//! the boundary layer's interesting transitions; otherwise the helpers
//! compile to nothing.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{debug, trace};

    pub(crate) fn log_heap_loaded(kind: &str, lowest: usize, highest: usize) {
        debug!(kind, lowest, highest, "heap_loaded");
    }

    pub(crate) fn log_wait_for_collection(thread_id: Option<u64>) {
        debug!(thread_id, "wait_for_collection");
    }

    pub(crate) fn log_alloc_sample(address: usize, size: usize) {
        trace!(address, size, "alloc_sample");
    }

    pub(crate) fn log_window_refilled(base: usize, limit: usize) {
        trace!(base, limit, "window_refilled");
    }

    pub(crate) fn log_hijack_installed(thread_id: u64) {
        debug!(thread_id, "hijack_installed");
    }

    pub(crate) fn log_hijack_resolved(thread_id: u64) {
        debug!(thread_id, "hijack_resolved");
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) mod internal {
    pub(crate) fn log_heap_loaded(_kind: &str, _lowest: usize, _highest: usize) {}

    pub(crate) fn log_wait_for_collection(_thread_id: Option<u64>) {}

    pub(crate) fn log_alloc_sample(_address: usize, _size: usize) {}

    pub(crate) fn log_window_refilled(_base: usize, _limit: usize) {}

    pub(crate) fn log_hijack_installed(_thread_id: u64) {}

    pub(crate) fn log_hijack_resolved(_thread_id: u64) {}
}
