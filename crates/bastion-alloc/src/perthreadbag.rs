//! `PerThreadBag`: the state for one `(threadSlot, classIndex)` pair,
//! fanned out across `BAG_SET_SIZE` parallel replicas ("bag-set items").
//!
//! Each bag-set item owns a bump pointer that sweeps across the subset of
//! heap replicas sharing its residue mod `BAG_SET_SIZE`, plus its own free
//! list and cached free list (kept per-item rather than shared across the
//! whole bag — see the cached-free-list race note in `DESIGN.md`).

use crate::freelist::FreeList;
use crate::spinlock::SpinLock;

/// Mutable state for one bag-set item, held behind its own spinlock.
pub struct BagSetItemState {
    /// Address of the next unissued object in this replica sequence.
    pub bump_ptr: usize,
    /// Address of the last usable object in the *current* heap replica.
    pub last_object: usize,
    /// Free list of objects owned by this bag-set item, pushed to by the
    /// owning thread's own frees.
    pub free_list: FreeList,
    /// Staging list for frees performed by a non-owning thread.
    pub cached_free_list: FreeList,
    /// Number of entries currently on `cached_free_list`.
    pub cached_free_count: usize,
    /// Whether a trailing guard page has been installed for the heap
    /// replica the bump pointer currently sweeps.
    pub guard_installed: bool,
}

impl BagSetItemState {
    pub const fn new(first_object: usize, last_object: usize) -> Self {
        Self {
            bump_ptr: first_object,
            last_object,
            free_list: FreeList::new(),
            cached_free_list: FreeList::new(),
            cached_free_count: 0,
            guard_installed: false,
        }
    }
}

/// One bag-set item plus its lock.
pub struct BagSetItem {
    pub lock: SpinLock<BagSetItemState>,
}

/// All state for one `(threadSlot, classIndex)` pair.
pub struct PerThreadBag {
    pub class_index: usize,
    pub class_size: usize,
    pub class_shift: u32,
    pub class_mask: usize,
    pub objects_per_bag: usize,
    /// Offset, within heap replica 0, of this bag's first byte.
    pub bag_start_offset: usize,
    /// Cumulative shadow-record count of every bag ordered before this one
    /// within a single heap's shadow region.
    pub bag_shadow_start: usize,
    pub guard_size: usize,
    pub drain_threshold: usize,
    pub items: Vec<BagSetItem>,
}

impl PerThreadBag {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class_index: usize,
        class_size: usize,
        class_shift: u32,
        objects_per_bag: usize,
        bag_start_offset: usize,
        bag_shadow_start: usize,
        guard_size: usize,
        drain_threshold: usize,
        bag_set_size: usize,
        heap_size: usize,
    ) -> Self {
        let items = (0..bag_set_size)
            .map(|bag_set_item| {
                let first_object = bag_set_item * heap_size + bag_start_offset;
                let last_object = first_object + (objects_per_bag - 1) * class_size;
                BagSetItem {
                    lock: SpinLock::new(BagSetItemState::new(first_object, last_object)),
                }
            })
            .collect();
        Self {
            class_index,
            class_size,
            class_shift,
            class_mask: class_size - 1,
            objects_per_bag,
            bag_start_offset,
            bag_shadow_start,
            guard_size,
            drain_threshold,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bag_set_items_start_at_expected_offsets() {
        let bag = PerThreadBag::new(0, 16, 4, 64, 0, 0, 4096, 16, 4, 0x1000);
        for (i, item) in bag.items.iter().enumerate() {
            let first = item.lock.with(|s| s.bump_ptr);
            assert_eq!(first, i * 0x1000);
        }
    }
}
