//! Virtual memory reservation primitives for the magpie runtime.
//!
//! A managed heap needs one contiguous span of address space that it can
//! carve allocation windows out of, plus small side tables (card table,
//! write-watch table) sized from that span. This crate wraps the platform
//! facilities for obtaining such spans: `mmap` on Unix, `VirtualAlloc` on
//! Windows.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// Reservation base addresses are aligned to this value. On Windows it is
/// typically 64KB; on Unix it equals the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Configuration for reserving a span of address space.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    hint_addr: usize,
    no_swap_reserve: bool,
}

impl ReserveOptions {
    /// Creates options for a reservation of `len` bytes.
    #[must_use]
    pub const fn new(len: usize) -> Self {
        Self {
            len,
            hint_addr: 0,
            no_swap_reserve: false,
        }
    }

    /// Requests a specific base address for the reservation.
    ///
    /// The operating system is free to ignore the hint; callers that care
    /// must check [`Reservation::base`] afterwards. The address should be
    /// aligned to [`allocation_granularity`].
    #[must_use]
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Skips swap-space accounting for the reservation where the platform
    /// supports it (`MAP_NORESERVE` on Linux).
    ///
    /// Large heap reservations are mostly untouched; accounting them
    /// against swap up front can fail spuriously on overcommit-averse
    /// systems.
    #[must_use]
    pub const fn no_swap_reserve(mut self, no_swap_reserve: bool) -> Self {
        self.no_swap_reserve = no_swap_reserve;
        self
    }

    /// Performs the reservation.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error if the address space cannot be
    /// obtained.
    pub fn reserve(&self) -> io::Result<Reservation> {
        let inner = unsafe { os::ReservationInner::map_anon(self.hint_addr, self.len, self.no_swap_reserve) }?;
        Ok(Reservation { inner })
    }
}

/// An owned, contiguous span of readable/writable address space.
///
/// The span is unmapped when the reservation is dropped. All addresses
/// handed out by the heap stay inside `[base, end)` for the lifetime of
/// the reservation, which is what makes index arithmetic over the span
/// sound.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Lowest address of the reserved span.
    #[must_use]
    pub fn base(&self) -> usize {
        self.inner.ptr() as usize
    }

    /// Length of the reserved span in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the reservation is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// One past the highest address of the reserved span.
    #[must_use]
    pub fn end(&self) -> usize {
        self.base() + self.len()
    }

    /// Whether `addr` falls inside the reserved span.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.end()
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}
