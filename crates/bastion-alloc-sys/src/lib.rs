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
pub use os::{advise_no_hugepage, protect_none, protect_read_write};

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// When requesting a specific address, it should be aligned to this granularity.
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

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Flushes the memory mapped region. Every mapping this crate hands out
    /// is anonymous, so this is a no-op; kept so callers written against a
    /// file-backed `Mmap` port without change.
    pub fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
    strict: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
            strict: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the mapping.
    ///
    /// This is a request to the OS to place the mapping at this specific virtual address.
    /// The OS is not required to honor this request (on some platforms), or the call
    /// may fail if the address is already in use or invalid.
    ///
    /// For the best chance of success:
    /// - The address should be aligned to `allocation_granularity()`.
    /// - The address range `[hint_addr, hint_addr + len)` should be free.
    pub fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to reserve swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    pub fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Sets whether the hint address is strict.
    ///
    /// If true, `map_anon` will return an error if the OS cannot map the memory
    /// at the exact requested `hint_addr`.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Creates an anonymous memory map.
    ///
    /// # Safety
    ///
    /// Callers that keep raw pointers derived from the returned `Mmap` past
    /// its drop are responsible for not using them afterward; the mapping
    /// itself is torn down on drop.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe {
            let inner =
                os::MmapInner::map_anon(self.hint_addr, self.len, self.populate, self.no_reserve)?;

            if self.strict && self.hint_addr != 0 {
                let ptr = inner.ptr() as usize;
                if ptr != self.hint_addr {
                    // MmapInner drop will unmap the wrong memory
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!(
                            "Strict hint failed: requested {:#x}, got {:#x}",
                            self.hint_addr, ptr
                        ),
                    ));
                }
            }

            inner
        };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn page_size_is_a_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn allocation_granularity_is_at_least_one_page() {
        let ag = allocation_granularity();
        assert_eq!(ag & (ag - 1), 0);
        assert!(ag >= page_size());
    }

    /// A bag replica or large-object mapping is plain anonymous memory,
    /// with no placement hint, exactly what `smallheap`/`bigheap` request.
    #[test]
    fn map_anon_yields_writable_page_aligned_memory() {
        let len = page_size();
        let mmap = unsafe { MmapOptions::new().len(len).map_anon().expect("map_anon") };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    /// Mirrors how a bag's guard page is toggled: mapped read-write, flipped
    /// to `PROT_NONE` when the region becomes a guard, restored before reuse.
    #[test]
    fn protect_none_then_protect_read_write_round_trips() {
        let len = page_size();
        let mmap = unsafe { MmapOptions::new().len(len).map_anon().expect("map_anon") };
        let ptr = mmap.ptr();

        unsafe {
            ptr::write_volatile(ptr, 7);
            protect_none(ptr, len).expect("protect_none");
            protect_read_write(ptr, len).expect("protect_read_write");
            // Still readable/writable after the round trip.
            ptr::write_volatile(ptr, 9);
            assert_eq!(ptr::read_volatile(ptr), 9);
        }
    }

    #[test]
    fn advise_no_hugepage_does_not_fail_on_a_fresh_mapping() {
        let len = page_size();
        let mmap = unsafe { MmapOptions::new().len(len).map_anon().expect("map_anon") };
        unsafe {
            advise_no_hugepage(mmap.ptr(), mmap.len()).expect("advise_no_hugepage");
        }
    }
}
