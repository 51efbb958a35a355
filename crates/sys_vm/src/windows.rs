use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` base addresses must be aligned to this value (typically
/// 64KB), which is larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves an anonymous read/write span, optionally at a hinted address.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `VirtualAlloc`.
    pub unsafe fn map_anon(hint_addr: usize, len: usize, _no_swap_reserve: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc, Layout};
            // Miri has no VirtualAlloc; fall back to the global allocator
            // with granularity alignment so address arithmetic behaves
            // the same.
            let align = allocation_granularity();
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            let _ = hint_addr;
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            let addr = if hint_addr == 0 {
                ptr::null()
            } else {
                hint_addr as *const std::ffi::c_void
            };

            let mut ptr = unsafe { VirtualAlloc(addr, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

            // If placement at the hint failed, let the OS choose.
            if ptr.is_null() && !addr.is_null() {
                ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            }

            if ptr.is_null() {
                return Err(Error::last_os_error());
            }

            Ok(Self { ptr, len })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let align = allocation_granularity();
                    let layout = Layout::from_size_align(self.len, align).unwrap();
                    dealloc(self.ptr.cast::<u8>(), layout);
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0.
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}
