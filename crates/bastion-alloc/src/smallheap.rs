//! The BIBOP small-object engine: arena bring-up, allocate, free, guard
//! pages and canaries.
//!
//! This is the direct descendant of the upstream `BibopHeap` class: same
//! bump-then-freelist allocation order, same bag-set randomization, same
//! guard-page and canary placement. The bitwise address decomposition
//! lives in [`crate::geometry`]; this module owns the memory and the
//! per-bag mutable state built on top of it.

use bastion_alloc_sys::{protect_none, Mmap, MmapOptions};

use crate::config::{Config, InitError};
use crate::diagnostics::{self, Violation};
use crate::geometry::{self, Coords};
use crate::perthreadbag::PerThreadBag;
use crate::rng;
use crate::shadow::{self, ShadowRecord, ALLOC_SENTINEL, CANARY_SENTINEL};

/// The BIBOP small-object engine.
pub struct SmallHeap {
    cfg: Config,
    heap: Mmap,
    shadow: Mmap,
    shadow_stride: usize,
    shadow_record_size: usize,
    page_size: usize,
    /// `bags[thread_slot][class_index]`, for `class_index` in the usable range.
    bags: Vec<Vec<PerThreadBag>>,
}

// SAFETY: every field is either immutable after construction or internally
// synchronized (`PerThreadBag`'s bag-set items are behind a `SpinLock`).
unsafe impl Sync for SmallHeap {}
unsafe impl Send for SmallHeap {}

impl SmallHeap {
    /// Brings up the heap and shadow arenas and all per-bag bookkeeping.
    pub fn init(cfg: Config) -> Result<Self, InitError> {
        cfg.validate()?;
        let page_size = bastion_alloc_sys::page_size();
        let last_class = cfg.last_usable_class();
        let shadow_record_size = std::mem::size_of::<ShadowRecord>();

        // Pass 1: per-class object counts (identical across thread slots)
        // and cumulative shadow offsets in heap-layout order.
        let mut objects_per_class = Vec::with_capacity(last_class + 1);
        for class_index in 0..=last_class {
            objects_per_class.push(geometry::objects_per_bag(
                &cfg,
                class_index,
                page_size,
                cfg.guard_pages,
            ));
        }
        let mut bag_shadow_starts = vec![vec![0usize; last_class + 1]; cfg.num_subheaps];
        let mut cursor = 0usize;
        for thread_slot in 0..cfg.num_subheaps {
            for class_index in 0..=last_class {
                bag_shadow_starts[thread_slot][class_index] = cursor;
                cursor += objects_per_class[class_index] * shadow_record_size;
            }
        }
        let objects_per_heap_bytes = cursor;
        let shadow_stride = shadow::next_power_of_two(objects_per_heap_bytes);

        let heap = unsafe {
            MmapOptions::new()
                .len(cfg.arena_size())
                .map_anon()
                .map_err(|source| InitError::ArenaMapFailed { arena: "heap", source })?
        };
        let shadow = unsafe {
            MmapOptions::new()
                .len(shadow_stride * cfg.num_heaps)
                .map_anon()
                .map_err(|source| InitError::ArenaMapFailed { arena: "shadow", source })?
        };
        unsafe {
            let _ = bastion_alloc_sys::advise_no_hugepage(heap.ptr(), heap.len());
            let _ = bastion_alloc_sys::advise_no_hugepage(shadow.ptr(), shadow.len());
        }

        let mut bags = Vec::with_capacity(cfg.num_subheaps);
        for thread_slot in 0..cfg.num_subheaps {
            let mut row = Vec::with_capacity(last_class + 1);
            for class_index in 0..=last_class {
                let class_size = geometry::class_size(&cfg, class_index);
                let class_shift = geometry::class_shift(&cfg, class_index);
                let objects = objects_per_class[class_index];
                let bag_start_offset = geometry::bag_start_offset(&cfg, thread_slot, class_index);
                let guard_size = if cfg.guard_pages {
                    page_size.max(class_size.min(page_size))
                } else {
                    0
                };
                let drain_threshold = (objects / cfg.cached_freelist_ratio).max(1);
                row.push(PerThreadBag::new(
                    class_index,
                    class_size,
                    class_shift,
                    objects,
                    bag_start_offset,
                    bag_shadow_starts[thread_slot][class_index],
                    guard_size,
                    drain_threshold,
                    cfg.bag_set_size,
                    cfg.heap_size(),
                ));
            }
            bags.push(row);
        }

        let small_heap = Self {
            cfg,
            heap,
            shadow,
            shadow_stride,
            shadow_record_size,
            page_size,
            bags,
        };

        if cfg.guard_pages {
            for row in &small_heap.bags {
                for bag in row {
                    for item in &bag.items {
                        item.lock.with(|state| {
                            small_heap.install_trailing_guard(bag, state.last_object);
                        });
                    }
                }
            }
        }

        Ok(small_heap)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Whether `ptr` falls inside the heap arena (not necessarily a valid
    /// object start).
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.heap.ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.heap.len()
    }

    fn offset_of(&self, ptr: *const u8) -> usize {
        ptr as usize - self.heap.ptr() as usize
    }

    fn addr_at(&self, offset: usize) -> *mut u8 {
        unsafe { self.heap.ptr().add(offset) }
    }

    fn shadow_record_addr(&self, bag: &PerThreadBag, heap_index: usize, object_index: usize) -> usize {
        let off = shadow::shadow_offset(
            heap_index,
            self.shadow_stride,
            bag.bag_shadow_start,
            object_index,
            self.shadow_record_size,
        );
        self.shadow.ptr() as usize + off
    }

    fn object_addr_from_shadow(&self, shadow_addr: usize, bag: &PerThreadBag) -> *mut u8 {
        let rel = shadow_addr - self.shadow.ptr() as usize;
        let heap_index = shadow::shadow_offset_to_heap_index(rel, self.shadow_stride);
        let within_heap = rel - heap_index * self.shadow_stride;
        let object_index = (within_heap - bag.bag_shadow_start) / self.shadow_record_size;
        let offset = heap_index * self.cfg.heap_size() + bag.bag_start_offset + object_index * bag.class_size;
        self.addr_at(offset)
    }

    fn install_trailing_guard(&self, bag: &PerThreadBag, last_object: usize) {
        if bag.guard_size == 0 {
            return;
        }
        let guard_start = last_object + bag.class_size;
        unsafe {
            let _ = protect_none(self.addr_at(guard_start), bag.guard_size);
        }
    }

    /// Allocates an object of `requested` bytes on behalf of `thread_slot`.
    /// Returns `None` when `requested` belongs to the large-object engine
    /// (caller must route it there) or the arena maps failed.
    #[must_use]
    pub fn allocate(&self, thread_slot: usize, requested: usize) -> Option<*mut u8> {
        let sized = if self.cfg.canary { requested.max(1) + 1 } else { requested.max(1) };
        let class_index = geometry::class_index_for_size(&self.cfg, sized)?;
        let bag = &self.bags[thread_slot][class_index];

        let rand = rng::next_word() as usize;
        let (bag_set_item, use_bump) = if self.cfg.bag_set_size > 1 {
            let item = rand & (self.cfg.bag_set_size - 1);
            let bump = (rand & (self.cfg.bag_set_randomizer() - 1)) == 0;
            (item, bump)
        } else {
            (0, false)
        };
        let item = &bag.items[bag_set_item];

        let addr = item.lock.with(|state| {
            if !use_bump && !state.free_list.is_empty() {
                let popped = unsafe { state.free_list.pop() }.expect("checked non-empty");
                self.object_addr_from_shadow(popped, bag)
            } else {
                let addr = self.addr_at(state.bump_ptr);
                self.advance_bump(bag, bag_set_item, state);
                addr
            }
        });

        if self.cfg.canary {
            unsafe {
                addr.add(bag.class_size - 1).write(CANARY_SENTINEL);
            }
        }
        let offset = self.offset_of(addr);
        let Coords { heap_index, object_index, .. } = geometry::decode(&self.cfg, offset);
        let shadow_addr = self.shadow_record_addr(bag, heap_index, object_index);
        unsafe {
            (*(shadow_addr as *const ShadowRecord)).set_next(ALLOC_SENTINEL);
        }
        Some(addr)
    }

    fn advance_bump(
        &self,
        bag: &PerThreadBag,
        bag_set_item: usize,
        state: &mut crate::perthreadbag::BagSetItemState,
    ) {
        let pre = state.bump_ptr;
        if pre < state.last_object {
            state.bump_ptr = pre + bag.class_size;
        } else {
            // `pre` sits on the last object of the current replica; step to
            // the next heap replica congruent to this bag-set item
            // (heap_index + bag_set_size preserves heap_index mod
            // bag_set_size), wrapping back to replica zero once every
            // replica owned by this item has been swept. By the time that
            // happens, the first replica's objects are reachable only
            // through its free lists, which `allocate` always tries before
            // falling back to the bump pointer, so the wrap cannot hand out
            // an address still backing a live object.
            let this_replica_first = pre - (bag.objects_per_bag - 1) * bag.class_size;
            let step = geometry::next_heap_object_offset(&self.cfg);
            let stepped = this_replica_first + step;
            let replica_zero_first = bag_set_item * self.cfg.heap_size() + bag.bag_start_offset;
            let next_first = if stepped + (bag.objects_per_bag - 1) * bag.class_size >= self.cfg.arena_size() {
                replica_zero_first
            } else {
                stepped
            };
            state.bump_ptr = next_first;
            state.last_object = next_first + (bag.objects_per_bag - 1) * bag.class_size;
            if self.cfg.guard_pages {
                self.install_trailing_guard(bag, state.last_object);
            }
        }

        if self.cfg.random_guard && pre % self.page_size == 0 {
            let draw = (rng::next_word() % 1_000_000) as f64 / 1_000_000.0;
            if draw < self.cfg.random_guard_prop && state.bump_ptr < state.last_object {
                let guard_len = if bag.class_size < self.page_size {
                    self.page_size
                } else {
                    bag.class_size
                };
                unsafe {
                    let _ = protect_none(self.addr_at(state.bump_ptr), guard_len);
                }
                state.bump_ptr += guard_len;
            }
        }
    }

    /// Checks up to `cfg.canary_neighbors` live objects on either side of
    /// `object_index` within the same bag, hopping shadow records rather
    /// than heap addresses so the walk stays inside this bag's slice of the
    /// shadow region. Catches an overflow that clobbered a neighbor's
    /// trailer without (yet) corrupting the freed object's own.
    fn check_neighbor_canaries(&self, bag: &PerThreadBag, heap_index: usize, object_index: usize) {
        for step in 1..=self.cfg.canary_neighbors {
            for neighbor_index in [object_index.checked_sub(step), object_index.checked_add(step)] {
                let Some(neighbor_index) = neighbor_index else { continue };
                if neighbor_index >= bag.objects_per_bag {
                    continue;
                }
                let neighbor_shadow_addr = self.shadow_record_addr(bag, heap_index, neighbor_index);
                let neighbor_record = unsafe { &*(neighbor_shadow_addr as *const ShadowRecord) };
                if !unsafe { neighbor_record.is_allocated() } {
                    continue;
                }
                let neighbor_addr = self.object_addr_from_shadow(neighbor_shadow_addr, bag);
                let byte = unsafe { *neighbor_addr.add(bag.class_size - 1) };
                if byte != CANARY_SENTINEL {
                    diagnostics::fatal(&Violation::CanaryViolation { addr: neighbor_addr as usize, neighbor: true });
                }
            }
        }
    }

    /// Frees a previously allocated small object. Aborts the process on any
    /// security violation, per contract.
    pub fn free(&self, freeing_thread_slot: usize, ptr: *mut u8) {
        let offset = self.offset_of(ptr);
        let coords = geometry::decode(&self.cfg, offset);
        let bag = &self.bags[coords.thread_slot][coords.class_index];

        if offset & bag.class_mask != 0 {
            diagnostics::fatal(&Violation::MisalignedFree { addr: ptr as usize });
        }

        let shadow_addr = self.shadow_record_addr(bag, coords.heap_index, coords.object_index);
        let record = unsafe { &*(shadow_addr as *const ShadowRecord) };
        if !unsafe { record.is_allocated() } {
            diagnostics::fatal(&Violation::DoubleOrInvalidFree { addr: ptr as usize });
        }

        if self.cfg.canary {
            let byte = unsafe { *ptr.add(bag.class_size - 1) };
            if byte != CANARY_SENTINEL {
                diagnostics::fatal(&Violation::CanaryViolation { addr: ptr as usize, neighbor: false });
            }
            self.check_neighbor_canaries(bag, coords.heap_index, coords.object_index);
        }

        if self.cfg.destroy_on_free && bag.class_size <= 2048 {
            unsafe {
                std::ptr::write_bytes(ptr, 0, bag.class_size);
            }
        }

        let item = &bag.items[coords.bag_set_item];
        item.lock.with(|state| {
            if freeing_thread_slot == coords.thread_slot {
                unsafe { state.free_list.push(shadow_addr) };
            } else {
                unsafe { state.cached_free_list.push(shadow_addr) };
                state.cached_free_count += 1;
                if state.cached_free_count > bag.drain_threshold {
                    unsafe { state.free_list.splice_front(&mut state.cached_free_list) };
                    state.cached_free_count = 0;
                }
            }
        });
    }

    /// Returns the usable size of a live object at `ptr`, or `None` if
    /// `ptr` does not fall inside the heap arena.
    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        if !self.contains(ptr) {
            return None;
        }
        let offset = self.offset_of(ptr);
        let coords = geometry::decode(&self.cfg, offset);
        let bag = &self.bags[coords.thread_slot][coords.class_index];
        Some(if self.cfg.canary { bag.class_size - 1 } else { bag.class_size })
    }
}
