//! The large-object engine: one anonymous mapping per allocation, tracked
//! in a pointer-keyed table under a single spinlock.
//!
//! Large objects are mapped so that the object's *end*, not its start, sits
//! on a page boundary: the returned pointer is offset into the mapping by
//! `pageUpSize - size`, so a linear overflow runs straight into an
//! unmapped guard region instead of the slack at the end of the last page.

use std::collections::HashMap;

use bastion_alloc_sys::{Mmap, MmapOptions};

use crate::diagnostics::{self, Violation};
use crate::spinlock::SpinLock;

struct BigObjectStatus {
    mapping: Mmap,
    requested_size: usize,
}

/// The large-object ("big heap") engine.
pub struct BigHeap {
    table: SpinLock<HashMap<usize, BigObjectStatus>>,
}

impl Default for BigHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl BigHeap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: SpinLock::new(HashMap::new()),
        }
    }

    /// Maps and registers a new large object of `size` bytes, returning a
    /// pointer whose last valid byte sits at the end of the mapping.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<*mut u8> {
        let page_size = bastion_alloc_sys::page_size();
        let page_up_size = align_up(size, page_size);
        let diff = page_up_size - size;

        let mapping = unsafe { MmapOptions::new().len(page_up_size).map_anon().ok()? };
        let base = mapping.ptr();
        let object_start = unsafe { base.add(diff) };

        self.table.with(|map| {
            map.insert(
                object_start as usize,
                BigObjectStatus {
                    mapping,
                    requested_size: size,
                },
            );
        });

        Some(object_start)
    }

    /// Looks up the requested size of a live large object, if `ptr` is one.
    #[must_use]
    pub fn object_size(&self, ptr: *const u8) -> Option<usize> {
        self.table.with(|map| map.get(&(ptr as usize)).map(|s| s.requested_size))
    }

    #[must_use]
    pub fn is_large_object(&self, ptr: *const u8) -> bool {
        self.table.with(|map| map.contains_key(&(ptr as usize)))
    }

    /// Unmaps and deregisters a large object. Aborts the process if `ptr`
    /// is not a live large-object pointer.
    pub fn free(&self, ptr: *mut u8) {
        let removed = self.table.with(|map| map.remove(&(ptr as usize)));
        match removed {
            Some(_status) => {
                // `_status.mapping` drops here and unmaps the region.
            }
            None => diagnostics::fatal(&Violation::UnknownPointerFree { addr: ptr as usize }),
        }
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_lookup_then_free() {
        let heap = BigHeap::new();
        let ptr = heap.allocate(10_000).expect("allocate");
        assert!(heap.is_large_object(ptr));
        assert_eq!(heap.object_size(ptr), Some(10_000));
        heap.free(ptr);
        assert!(!heap.is_large_object(ptr));
    }

    #[test]
    fn object_end_is_page_aligned() {
        let heap = BigHeap::new();
        let size = 10_000;
        let ptr = heap.allocate(size).expect("allocate");
        let page_size = bastion_alloc_sys::page_size();
        let end = ptr as usize + size;
        assert_eq!(end % page_size, 0, "object must end exactly on a page boundary");
    }

    #[test]
    fn unrelated_pointer_is_not_a_large_object() {
        let heap = BigHeap::new();
        let stack_var = 0u8;
        assert!(!heap.is_large_object(&stack_var));
    }
}
