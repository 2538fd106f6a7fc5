//! A hardened `BiBOP` (Big Bag of Pages) memory allocator.
//!
//! `bastion_alloc` segregates every allocation into a size-class bag whose
//! owning thread slot and class are recoverable from the address alone, by
//! construction rather than by a header: each object's metadata lives
//! out-of-band in a parallel shadow region, so corrupting the object body
//! cannot corrupt the bookkeeping that frees it. On top of that it adds
//! the hardening the upstream design calls for: canaries on every small
//! object, guard pages around every bag, and a cached free list per bag-set
//! replica to keep cross-thread frees off the allocating thread's hot path.
//!
//! # Security model
//!
//! Every violation this allocator can detect — a double free, a misaligned
//! free, a free of an address it never handed out, a stomped canary — is
//! fatal. There is no `Result`-returning path for any of them: the process
//! aborts, because by the time one is observed the heap's invariants may
//! already be broken for every other allocation sharing the bag.
//!
//! # Feature flags
//!
//! - `canary` (default): reserve and check a trailing canary byte on every
//!   small object.
//! - `guard-pages` (default): install a trailing guard page after every bag
//!   replica, plus randomized intra-bag guard pages.
//! - `abi` (default): build the [`abi`] module's C-callable
//!   `malloc`/`free`/... entry points, for use as an `LD_PRELOAD` (or
//!   platform equivalent) heap replacement.
//! - `tracing`: route diagnostics through the `tracing` crate instead of
//!   `eprintln!`.
//! - `stats`: track lightweight allocation counters (see [`stats`]).

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

#[cfg(feature = "abi")]
pub mod abi;
mod bigheap;
mod bootstrap;
pub mod config;
mod diagnostics;
mod freelist;
mod geometry;
mod perthreadbag;
mod real;
mod rng;
mod shadow;
mod smallheap;
mod spinlock;
#[cfg(feature = "stats")]
pub mod stats;
mod thread_registry;

pub use config::{Config, InitError};
pub use diagnostics::Violation;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use bigheap::BigHeap;
use smallheap::SmallHeap;
use thread_registry::ThreadRegistry;

const INIT_NOT_STARTED: u8 = 0;
const INIT_WORKING: u8 = 1;
const INIT_DONE: u8 = 2;

/// The allocator engine: the small-object bags, the large-object table and
/// the thread registry, brought up once per process behind a three-state
/// latch (not-started / working / done) rather than a plain
/// once-and-block primitive, because the engine's own bring-up allocates
/// (the `HashMap`s backing [`bigheap::BigHeap`] and
/// [`thread_registry::ThreadRegistry`]) and those allocations must be
/// recognizable as "still initializing" so they can be routed to
/// [`bootstrap`] instead of recursing back into [`init`].
pub struct Allocator {
    config: Config,
    small: SmallHeap,
    big: BigHeap,
    threads: ThreadRegistry,
}

static INIT_STATE: AtomicU8 = AtomicU8::new(INIT_NOT_STARTED);
static ENGINE: OnceLock<Allocator> = OnceLock::new();

/// Current bring-up phase of the process-wide allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    /// Nobody has touched the allocator yet.
    NotStarted,
    /// A thread is currently bringing the engine up; callers on other
    /// threads (or recursive calls from the initializing thread itself)
    /// must not allocate through the engine yet.
    Working,
    /// The engine is fully initialized and safe to allocate through.
    Done,
}

/// Reads the current bring-up phase without side effects.
#[must_use]
pub fn init_phase() -> InitPhase {
    match INIT_STATE.load(Ordering::Acquire) {
        INIT_WORKING => InitPhase::Working,
        INIT_DONE => InitPhase::Done,
        _ => InitPhase::NotStarted,
    }
}

/// Returns the process-wide engine, bringing it up with [`Config::default`]
/// on first call. Returns `None` while another thread's call to this
/// function (or a reentrant call from this same thread, made while that
/// bring-up is itself allocating) is in flight; callers in that state
/// should fall back to [`bootstrap::alloc`].
pub fn engine() -> Option<&'static Allocator> {
    if let Some(engine) = ENGINE.get() {
        return Some(engine);
    }
    if INIT_STATE
        .compare_exchange(INIT_NOT_STARTED, INIT_WORKING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let built = Allocator::new(Config::default()).unwrap_or_else(|err| {
            eprintln!("bastion-alloc: failed to initialize: {err}");
            std::process::abort();
        });
        let _ = ENGINE.set(built);
        INIT_STATE.store(INIT_DONE, Ordering::Release);
        return ENGINE.get();
    }
    // Either another thread is working on it, or this is a reentrant call
    // from the thread currently doing so; either way the caller must not
    // block here (a spin-wait on the initializing thread would deadlock
    // the reentrant case), so it falls back to the bootstrap arena.
    if INIT_STATE.load(Ordering::Acquire) == INIT_DONE {
        ENGINE.get()
    } else {
        None
    }
}

impl Allocator {
    /// Brings up a standalone engine with an explicit configuration,
    /// independent of the process-wide singleton. Used by tests and by
    /// embedders that want a private allocator instance rather than the
    /// `abi` module's global one.
    pub fn new(config: Config) -> Result<Self, InitError> {
        let small = SmallHeap::init(config)?;
        Ok(Self {
            config,
            small,
            big: BigHeap::new(),
            threads: ThreadRegistry::new(config.num_subheaps),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Allocates `size` bytes, routing to the large-object engine above
    /// `large_threshold` and to the small-object bags below it.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<*mut u8> {
        if size > self.config.large_threshold {
            let ptr = self.big.allocate(size);
            #[cfg(feature = "stats")]
            if ptr.is_some() {
                crate::stats::record_large_allocation();
            }
            ptr
        } else {
            let slot = self.threads.current_slot();
            let ptr = self.small.allocate(slot, size);
            #[cfg(feature = "stats")]
            if ptr.is_some() {
                crate::stats::record_small_allocation();
            }
            ptr
        }
    }

    /// Frees a pointer previously returned by [`Allocator::allocate`].
    /// Aborts the process if `ptr` is not a live pointer this engine owns.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if self.small.contains(ptr) {
            let slot = self.threads.current_slot();
            self.small.free(slot, ptr);
            #[cfg(feature = "stats")]
            crate::stats::record_small_free();
        } else if self.big.is_large_object(ptr) {
            self.big.free(ptr);
            #[cfg(feature = "stats")]
            crate::stats::record_large_free();
        } else {
            diagnostics::fatal(&Violation::UnknownPointerFree { addr: ptr as usize });
        }
    }

    /// Usable size of a live allocation, or `None` if `ptr` is not one this
    /// engine owns.
    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        if self.small.contains(ptr) {
            self.small.usable_size(ptr)
        } else {
            self.big.object_size(ptr)
        }
    }

    /// Registers a thread (normally called from the `pthread_create` hook
    /// in [`abi`], from within the new thread itself) and returns its slot
    /// index. Seeds the calling thread's slot cache so its first allocation
    /// does not register a second, redundant slot.
    pub fn register_thread(&self, pthread: libc::pthread_t) -> usize {
        self.threads.register_self(pthread)
    }

    /// Releases a thread's slot (normally called from the `pthread_join`
    /// hook in [`abi`]).
    pub fn release_thread(&self, pthread: libc::pthread_t) {
        self.threads.release(pthread);
    }

    #[must_use]
    pub fn alive_thread_count(&self) -> usize {
        self.threads.alive_count()
    }
}

#[doc(hidden)]
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use crate::{Allocator, Config};

    /// Builds a standalone engine over [`Config::small_for_tests`], for use
    /// in integration tests that want a fresh, small-footprint heap rather
    /// than the process-wide singleton.
    #[must_use]
    pub fn small_engine() -> Allocator {
        Allocator::new(Config::small_for_tests()).expect("small_for_tests must validate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_engine_round_trips_an_allocation() {
        let engine = test_util::small_engine();
        let ptr = engine.allocate(64).expect("allocate");
        assert_eq!(engine.usable_size(ptr), Some(64));
        engine.free(ptr);
    }

    #[test]
    fn standalone_engine_routes_large_requests_to_big_heap() {
        let engine = test_util::small_engine();
        let large = engine.config().large_threshold + 1;
        let ptr = engine.allocate(large).expect("allocate");
        assert_eq!(engine.usable_size(ptr), Some(large));
        engine.free(ptr);
    }
}
