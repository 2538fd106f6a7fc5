//! The thread registry: a dense, fixed-size array of thread slots plus a
//! `pthread_t` → slot-index map, so every thread gets a stable, small
//! integer identity for indexing into the per-thread-slot bags.
//!
//! Slots are reused: when a thread exits (observed through the `abi`
//! module's `pthread_join` hook), its slot is marked available again for
//! the next `pthread_create`. Index 0 is always the process's initial
//! thread.

use std::cell::Cell;
use std::collections::HashMap;

use crate::diagnostics;
use crate::spinlock::SpinLock;

struct Slot {
    available: bool,
}

struct Registry {
    slots: Vec<Slot>,
    next_index: usize,
    alive: usize,
    by_pthread: HashMap<libc::pthread_t, usize>,
}

/// The process-wide thread registry.
pub struct ThreadRegistry {
    capacity: usize,
    inner: SpinLock<Registry>,
}

thread_local! {
    static MY_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot { available: true }).collect();
        Self {
            capacity,
            inner: SpinLock::new(Registry {
                slots,
                next_index: 0,
                alive: 0,
                by_pthread: HashMap::new(),
            }),
        }
    }

    /// Returns the calling thread's slot, registering it as the initial
    /// thread (index 0) on first call if nothing has registered yet.
    pub fn current_slot(&self) -> usize {
        if let Some(slot) = MY_SLOT.with(Cell::get) {
            return slot;
        }
        let slot = self.register(unsafe { libc::pthread_self() });
        MY_SLOT.with(|cell| cell.set(Some(slot)));
        slot
    }

    /// Registers `pthread` and seeds the calling thread's `MY_SLOT` cache
    /// with the result, so a later [`Self::current_slot`] call on this same
    /// thread (its first allocation) finds its slot already assigned
    /// instead of registering a second one.
    ///
    /// Must be called from the thread being registered, not on its behalf
    /// by another thread.
    pub fn register_self(&self, pthread: libc::pthread_t) -> usize {
        let slot = self.register(pthread);
        MY_SLOT.with(|cell| cell.set(Some(slot)));
        slot
    }

    /// Allocates a free slot for `pthread`, aborting if the registry is
    /// full (the upstream design bounds this at a fixed `MAX_ALIVE_THREADS`
    /// rather than growing it at runtime).
    pub fn register(&self, pthread: libc::pthread_t) -> usize {
        self.inner.with(|reg| {
            let index = if reg.alive == reg.next_index {
                let index = reg.next_index;
                if index >= self.capacity {
                    diagnostics::warn_unsupported("thread registry exhausted");
                    return self.capacity - 1;
                }
                reg.next_index += 1;
                reg.slots[index].available = false;
                index
            } else {
                match reg.slots.iter().position(|s| s.available) {
                    Some(index) => {
                        reg.slots[index].available = false;
                        index
                    }
                    None => {
                        diagnostics::warn_unsupported("thread registry exhausted");
                        self.capacity - 1
                    }
                }
            };
            reg.alive += 1;
            reg.by_pthread.insert(pthread, index);
            index
        })
    }

    /// Releases the slot owned by `pthread` back to the free pool.
    pub fn release(&self, pthread: libc::pthread_t) {
        self.inner.with(|reg| {
            if let Some(index) = reg.by_pthread.remove(&pthread) {
                reg.slots[index].available = true;
                reg.alive = reg.alive.saturating_sub(1);
            } else {
                diagnostics::warn_untracked_join();
            }
        });
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.inner.with(|reg| reg.alive)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
