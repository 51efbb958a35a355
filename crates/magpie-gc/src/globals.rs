//! Collector-facing exported values.
//!
//! The collector and the write-barrier side both read a small block of
//! process-wide values: the tracked heap bounds, the ephemeral-generation
//! range, and the side-table base addresses. They change only while a
//! collection holds the world stopped, so readers elsewhere use relaxed
//! loads; publication uses release stores so a reader that sees a new
//! bound also sees the tables sized for it.

use std::sync::atomic::{AtomicUsize, Ordering};

/// The exported-value block owned by the heap registry.
#[derive(Debug)]
pub struct CollectorGlobals {
    lowest_address: AtomicUsize,
    highest_address: AtomicUsize,
    ephemeral_low: AtomicUsize,
    ephemeral_high: AtomicUsize,
    card_table: AtomicUsize,
    card_bundle_table: AtomicUsize,
    write_watch_table: AtomicUsize,
}

impl CollectorGlobals {
    pub(crate) const fn new() -> Self {
        Self {
            lowest_address: AtomicUsize::new(0),
            highest_address: AtomicUsize::new(0),
            ephemeral_low: AtomicUsize::new(0),
            ephemeral_high: AtomicUsize::new(0),
            card_table: AtomicUsize::new(0),
            card_bundle_table: AtomicUsize::new(0),
            write_watch_table: AtomicUsize::new(0),
        }
    }

    /// Lowest address tracked by the heap.
    #[must_use]
    pub fn lowest_address(&self) -> usize {
        self.lowest_address.load(Ordering::Relaxed)
    }

    /// Highest address tracked by the heap.
    #[must_use]
    pub fn highest_address(&self) -> usize {
        self.highest_address.load(Ordering::Relaxed)
    }

    /// Whether `addr` falls inside the tracked heap range.
    #[must_use]
    pub fn in_heap_range(&self, addr: usize) -> bool {
        addr >= self.lowest_address() && addr < self.highest_address()
    }

    /// The ephemeral-generation address range `[low, high)`.
    #[must_use]
    pub fn ephemeral_range(&self) -> (usize, usize) {
        (
            self.ephemeral_low.load(Ordering::Relaxed),
            self.ephemeral_high.load(Ordering::Relaxed),
        )
    }

    /// Base address of the card table.
    #[must_use]
    pub fn card_table(&self) -> usize {
        self.card_table.load(Ordering::Relaxed)
    }

    /// Base address of the card bundle table.
    #[must_use]
    pub fn card_bundle_table(&self) -> usize {
        self.card_bundle_table.load(Ordering::Relaxed)
    }

    /// Base address of the software write-watch table.
    #[must_use]
    pub fn write_watch_table(&self) -> usize {
        self.write_watch_table.load(Ordering::Relaxed)
    }

    /// Publishes the tracked heap range. Collection-time only.
    pub fn publish_heap_range(&self, lowest: usize, highest: usize) {
        debug_assert!(lowest <= highest);
        self.lowest_address.store(lowest, Ordering::Release);
        self.highest_address.store(highest, Ordering::Release);
    }

    /// Publishes the ephemeral-generation range. Collection-time only.
    pub fn publish_ephemeral_range(&self, low: usize, high: usize) {
        debug_assert!(low <= high);
        self.ephemeral_low.store(low, Ordering::Release);
        self.ephemeral_high.store(high, Ordering::Release);
    }

    /// Publishes the card table bases. Collection-time only.
    pub fn publish_card_tables(&self, card_table: usize, card_bundle_table: usize) {
        self.card_table.store(card_table, Ordering::Release);
        self.card_bundle_table
            .store(card_bundle_table, Ordering::Release);
    }

    /// Publishes the write-watch table base. Collection-time only.
    pub fn publish_write_watch_table(&self, base: usize) {
        self.write_watch_table.store(base, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::CollectorGlobals;

    #[test]
    fn range_checks_follow_published_bounds() {
        let globals = CollectorGlobals::new();
        assert!(!globals.in_heap_range(0x5000));

        globals.publish_heap_range(0x4000, 0x8000);
        assert!(globals.in_heap_range(0x4000));
        assert!(globals.in_heap_range(0x7FFF));
        assert!(!globals.in_heap_range(0x8000));
        assert!(!globals.in_heap_range(0x3FFF));
    }
}
