//! Software write watch for the GC heap.
//!
//! The collector prunes incremental rescan work by consulting a table with
//! one byte per heap page: zero means the page has not been written since
//! the table was last reset, `0xFF` means it has. Mutator-side write
//! barriers set entries; only the collector reads or clears them.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Constants
// ============================================================================

/// Size of a tracked page.
pub const PAGE_SIZE: usize = 4096;

/// Shift converting an address to a page index.
pub const PAGE_SHIFT: u32 = 12;

/// Sentinel stored for a written page. Any nonzero value means "dirty";
/// all-ones is the convention.
pub const DIRTY: u8 = 0xFF;

// ============================================================================
// WriteWatchTable
// ============================================================================

/// Byte-per-page dirty table spanning the heap's tracked address range.
///
/// The table is translated so that index 0 corresponds to the lowest
/// tracked address, which keeps the barrier-side index computation to a
/// shift and a subtract.
///
/// Entries are set-only while mutators run; they are never cleared
/// concurrently with a set, so relaxed stores suffice. A reader racing a
/// set may observe "not yet dirty" and must compensate conservatively
/// (the collector rescans).
pub struct WriteWatchTable {
    /// Lowest tracked address, expressed in pages.
    lowest_page: usize,
    entries: Box<[AtomicU8]>,
    enabled: AtomicBool,
}

impl WriteWatchTable {
    /// Builds a table covering `[lowest_address, highest_address)`.
    ///
    /// The bounds are widened to page boundaries. The table starts
    /// disabled; the collector enables it for the scans that need it.
    ///
    /// # Panics
    ///
    /// Panics if `lowest_address > highest_address`.
    #[must_use]
    pub fn new(lowest_address: usize, highest_address: usize) -> Self {
        assert!(
            lowest_address <= highest_address,
            "inverted tracked range {lowest_address:#x}..{highest_address:#x}"
        );
        let lowest_page = lowest_address >> PAGE_SHIFT;
        let highest_page = (highest_address + PAGE_SIZE - 1) >> PAGE_SHIFT;
        let entries = (lowest_page..highest_page)
            .map(|_| AtomicU8::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            lowest_page,
            entries,
            enabled: AtomicBool::new(false),
        }
    }

    /// Whether write watch is currently enabled.
    ///
    /// Barrier code checks this before calling [`set_dirty`]; the
    /// collector turns the table off between scans so untracked phases
    /// pay nothing.
    ///
    /// [`set_dirty`]: Self::set_dirty
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enables or disables the table. Collector-only.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Number of pages the table covers.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.entries.len()
    }

    /// Address of the first table entry, exported for the collector and
    /// barrier code that index the table directly.
    #[must_use]
    pub fn table_base(&self) -> usize {
        self.entries.as_ptr() as usize
    }

    #[inline]
    fn index_of(&self, address: usize) -> usize {
        (address >> PAGE_SHIFT) - self.lowest_page
    }

    /// Marks the page containing `address` dirty after a single
    /// pointer-sized write.
    ///
    /// Idempotent: racing threads storing the same sentinel need no
    /// synchronization. The write being recorded must be at most one
    /// pointer wide and must not cross a page boundary; a wider or
    /// straddling write could dirty two pages and needs
    /// [`set_dirty_range`] instead. That is a caller contract, checked
    /// only in debug builds.
    ///
    /// [`set_dirty_range`]: Self::set_dirty_range
    #[inline]
    pub fn set_dirty(&self, address: usize, write_size: usize) {
        debug_assert!(address != 0, "write watch on a null address");
        debug_assert!(
            write_size > 0 && write_size <= std::mem::size_of::<*const u8>(),
            "write watch on a {write_size}-byte write"
        );
        debug_assert_eq!(
            self.index_of(address),
            self.index_of(address + (write_size - 1)),
            "write watch on a write crossing a page boundary"
        );

        let entry = &self.entries[self.index_of(address)];
        if entry.load(Ordering::Relaxed) == 0 {
            entry.store(DIRTY, Ordering::Relaxed);
        }
    }

    /// Marks every page intersecting `[address, address + length)` dirty
    /// after a bulk copy.
    ///
    /// This is a block fill, not per-entry zero tests: the common case
    /// for bulk copies is that most pages in the range need marking
    /// anyway.
    pub fn set_dirty_range(&self, address: usize, length: usize) {
        debug_assert!(address != 0, "write watch on a null range");
        debug_assert!(length > 0, "write watch on an empty range");

        let base = self.index_of(address);
        let end = self.index_of(address + length - 1);
        for entry in &self.entries[base..=end] {
            entry.store(DIRTY, Ordering::Relaxed);
        }
    }

    /// Whether the page containing `address` is marked dirty.
    /// Collector-side read.
    #[must_use]
    pub fn is_dirty(&self, address: usize) -> bool {
        self.entries[self.index_of(address)].load(Ordering::Relaxed) != 0
    }

    /// Number of pages currently marked dirty.
    #[must_use]
    pub fn dirty_page_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Clears every entry.
    ///
    /// Runs only while mutators are quiesced; a reset concurrent with a
    /// set would lose the set.
    pub fn reset(&self) {
        for entry in self.entries.iter() {
            entry.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for WriteWatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteWatchTable")
            .field("lowest_page", &self.lowest_page)
            .field("pages", &self.entries.len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
