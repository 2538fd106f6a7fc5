//! Pure address-bit algebra: decomposing an offset into the heap arena into
//! `(heapIndex, threadSlot, classIndex, bagSetItem, objectIndex)` and back.
//!
//! None of these functions touch memory; they only see a byte offset from
//! the arena base and the [`Config`] that defines the arena's shape. This
//! mirrors how the upstream allocator keeps its `getShadowObjectInfo`
//! address math free of any pointer chasing before the final step.

use crate::config::Config;

/// The five coordinates that uniquely identify the bag (and slot within it)
/// that owns a given arena offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coords {
    pub heap_index: usize,
    pub thread_slot: usize,
    pub class_index: usize,
    pub bag_set_item: usize,
    pub object_index: usize,
}

/// `classSize = MIN_BLOCK << classIndex`.
#[must_use]
pub const fn class_size(cfg: &Config, class_index: usize) -> usize {
    cfg.min_block << class_index
}

/// `classShift = log2(classSize)`.
#[must_use]
pub const fn class_shift(cfg: &Config, class_index: usize) -> u32 {
    cfg.first_bag_power() + class_index as u32
}

/// Smallest class index whose size is `>= max(cfg.min_block, requested)`,
/// i.e. `classSize = max(MIN_BLOCK, next_power_of_two(requested))`.
///
/// A `requested` size of zero is treated as the minimum class (spec edge case).
#[must_use]
pub fn class_index_for_size(cfg: &Config, requested: usize) -> Option<usize> {
    let wanted = requested.max(1).next_power_of_two().max(cfg.min_block);
    if wanted.trailing_zeros() < cfg.first_bag_power() {
        return None;
    }
    let idx = (wanted.trailing_zeros() - cfg.first_bag_power()) as usize;
    if idx > cfg.last_usable_class() {
        None
    } else {
        Some(idx)
    }
}

/// Decomposes a byte offset from the arena base into its owning coordinates.
#[must_use]
pub fn decode(cfg: &Config, offset: usize) -> Coords {
    let heap_mask = cfg.heap_size() - 1;
    let bag_mask = cfg.bag_size - 1;

    let heap_index = offset >> cfg.heap_shift();
    let offset_in_heap = offset & heap_mask;
    let thread_slot = offset_in_heap >> cfg.sub_heap_shift();
    let global_bag = offset_in_heap >> cfg.bag_shift();
    let class_index = global_bag & (cfg.num_bags - 1);
    let local_bag_offset = offset_in_heap & bag_mask;
    let object_index = local_bag_offset >> class_shift(cfg, class_index);
    let bag_set_item = heap_index & (cfg.bag_set_size - 1);

    Coords {
        heap_index,
        thread_slot,
        class_index,
        bag_set_item,
        object_index,
    }
}

/// Inverse of [`decode`]: recomputes the byte offset from the arena base
/// that these coordinates describe. `bag_set_item` is not itself encoded in
/// the offset (it is a property of which of the `BAG_SET_SIZE` heap
/// replicas `heap_index` falls into), so it is accepted only to make the
/// bijection check in tests symmetric; it must already be consistent with
/// `heap_index`.
#[must_use]
pub fn encode(cfg: &Config, coords: Coords) -> usize {
    let size = class_size(cfg, coords.class_index);
    let offset_in_subheap = coords.class_index * cfg.bag_size + coords.object_index * size;
    let offset_in_heap = coords.thread_slot * cfg.sub_heap_size() + offset_in_subheap;
    coords.heap_index * cfg.heap_size() + offset_in_heap
}

/// Byte offset, within a heap, of the first object of bag `class_index`
/// belonging to `thread_slot`.
#[must_use]
pub const fn bag_start_offset(cfg: &Config, thread_slot: usize, class_index: usize) -> usize {
    thread_slot * cfg.sub_heap_size() + class_index * cfg.bag_size
}

/// Number of whole objects of `class_index` that fit in one bag, reserving
/// room for a trailing guard page when `guard_pages` is set and the class
/// is smaller than a page.
#[must_use]
pub fn objects_per_bag(cfg: &Config, class_index: usize, page_size: usize, guard_pages: bool) -> usize {
    let size = class_size(cfg, class_index);
    let usable = if guard_pages && size < page_size {
        cfg.bag_size - page_size
    } else if guard_pages {
        cfg.bag_size - size
    } else {
        cfg.bag_size
    };
    usable / size
}

/// Offset, relative to the bump pointer sitting at the last object of one
/// bag replica, that lands on the first object of the *same* bag in the
/// next heap replica (`nextHeapObjectOffset` in the source algebra).
#[must_use]
pub const fn next_heap_object_offset(cfg: &Config) -> usize {
    cfg.heap_size() * cfg.bag_set_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_size_monotonic() {
        let cfg = Config::small_for_tests();
        for k in 0..cfg.num_bags - 1 {
            assert!(class_size(&cfg, k) < class_size(&cfg, k + 1));
        }
    }

    #[test]
    fn class_index_for_size_picks_least_sufficient_class() {
        let cfg = Config::small_for_tests();
        assert_eq!(class_index_for_size(&cfg, 1), Some(0));
        assert_eq!(class_index_for_size(&cfg, cfg.min_block), Some(0));
        assert_eq!(class_index_for_size(&cfg, cfg.min_block + 1), Some(1));
        assert_eq!(class_index_for_size(&cfg, 0), Some(0));
    }

    #[test]
    fn class_index_for_size_rejects_above_last_usable() {
        let cfg = Config::small_for_tests();
        let too_big = (cfg.min_block << cfg.last_usable_class()) + 1;
        assert_eq!(class_index_for_size(&cfg, too_big), None);
    }

    #[test]
    fn decode_encode_round_trip() {
        let cfg = Config::small_for_tests();
        for heap_index in [0usize, 1, cfg.num_heaps - 1] {
            for thread_slot in [0usize, cfg.num_subheaps - 1] {
                for class_index in 0..=cfg.last_usable_class() {
                    for object_index in [0usize, 1, 3] {
                        let coords = Coords {
                            heap_index,
                            thread_slot,
                            class_index,
                            bag_set_item: heap_index & (cfg.bag_set_size - 1),
                            object_index,
                        };
                        let offset = encode(&cfg, coords);
                        let decoded = decode(&cfg, offset);
                        assert_eq!(decoded, coords, "round trip mismatch at offset {offset:#x}");
                    }
                }
            }
        }
    }

    #[test]
    fn decode_is_alignment_preserving() {
        let cfg = Config::small_for_tests();
        let coords = Coords {
            heap_index: 0,
            thread_slot: 2,
            class_index: 3,
            bag_set_item: 0,
            object_index: 5,
        };
        let offset = encode(&cfg, coords);
        let size = class_size(&cfg, coords.class_index);
        let bag_start = bag_start_offset(&cfg, coords.thread_slot, coords.class_index);
        assert_eq!((offset - bag_start) % size, 0);
    }
}
