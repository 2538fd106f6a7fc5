//! Lightweight, process-wide allocation counters.
//!
//! These are plain atomics, not sampled or time-windowed: every
//! [`Allocator::allocate`](crate::Allocator::allocate) and
//! [`Allocator::free`](crate::Allocator::free) call updates them inline,
//! so reading [`snapshot`] never blocks and never lags by more than the
//! in-flight calls on other threads.

use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_SMALL_OBJECTS: AtomicUsize = AtomicUsize::new(0);
static LIVE_LARGE_OBJECTS: AtomicUsize = AtomicUsize::new(0);
static TOTAL_SMALL_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
static TOTAL_LARGE_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// A point-in-time read of the process-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Small objects currently allocated and not yet freed.
    pub live_small_objects: usize,
    /// Large objects currently allocated and not yet freed.
    pub live_large_objects: usize,
    /// Small-object allocations since process start.
    pub total_small_allocations: usize,
    /// Large-object allocations since process start.
    pub total_large_allocations: usize,
}

/// Reads the current counters.
#[must_use]
pub fn snapshot() -> Snapshot {
    Snapshot {
        live_small_objects: LIVE_SMALL_OBJECTS.load(Ordering::Relaxed),
        live_large_objects: LIVE_LARGE_OBJECTS.load(Ordering::Relaxed),
        total_small_allocations: TOTAL_SMALL_ALLOCATIONS.load(Ordering::Relaxed),
        total_large_allocations: TOTAL_LARGE_ALLOCATIONS.load(Ordering::Relaxed),
    }
}

pub(crate) fn record_small_allocation() {
    LIVE_SMALL_OBJECTS.fetch_add(1, Ordering::Relaxed);
    TOTAL_SMALL_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_small_free() {
    LIVE_SMALL_OBJECTS.fetch_sub(1, Ordering::Relaxed);
}

pub(crate) fn record_large_allocation() {
    LIVE_LARGE_OBJECTS.fetch_add(1, Ordering::Relaxed);
    TOTAL_LARGE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_large_free() {
    LIVE_LARGE_OBJECTS.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocation_then_free_nets_to_zero_live() {
        let before = snapshot();
        record_small_allocation();
        record_small_free();
        let after = snapshot();
        assert_eq!(after.live_small_objects, before.live_small_objects);
        assert_eq!(after.total_small_allocations, before.total_small_allocations + 1);
    }
}
