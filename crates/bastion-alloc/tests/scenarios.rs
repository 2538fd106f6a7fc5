//! End-to-end scenarios against the documented literal behavior of the
//! allocator (deterministic geometry: one bag-set replica, canaries and
//! guard pages off so the only variable under test is allocation routing).
//! The scenarios that are expected to crash the process live in
//! `tests/violations.rs` instead.

use bastion_alloc::{Allocator, Config};

fn deterministic_config() -> Config {
    let mut cfg = Config::small_for_tests();
    cfg.canary = false;
    cfg.guard_pages = false;
    cfg.random_guard = false;
    cfg.bag_set_size = 1;
    cfg
}

fn deterministic_engine() -> Allocator {
    Allocator::new(deterministic_config()).expect("deterministic config must validate")
}

/// S1: a one-byte request rounds up to the minimum class, is class-aligned,
/// and an immediate same-size alloc after free reuses the same address.
#[test]
fn s1_minimum_class_lifo_reuse() {
    let engine = deterministic_engine();
    let p = engine.allocate(1).expect("alloc");
    assert_eq!(engine.usable_size(p), Some(16));
    assert_eq!(p as usize % 16, 0);
    engine.free(p);
    let q = engine.allocate(16).expect("alloc2");
    assert_eq!(p, q);
    engine.free(q);
}

/// S2 (non-crashing half): a 24-byte request rounds up to 32, is fully
/// writable, and frees cleanly. The second `free(p)` aborting is covered by
/// `tests/violations.rs::double_free_of_small_object_aborts`.
#[test]
fn s2_rounds_up_and_is_fully_writable() {
    let engine = deterministic_engine();
    let p = engine.allocate(24).expect("alloc");
    assert_eq!(engine.usable_size(p), Some(32));
    unsafe {
        std::ptr::write_bytes(p, 0xCD, 32);
    }
    engine.free(p);
}

/// S4: an object allocated by a spawned thread and freed by main takes the
/// cached-free-list path; enough same-class cross-thread frees drain it
/// into the real free list.
#[test]
fn s4_cross_thread_free_uses_cached_list_and_drains() {
    let engine = std::sync::Arc::new(deterministic_engine());
    let worker = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.allocate(16).expect("alloc on worker") as usize)
    };
    let p = worker.join().expect("worker thread") as *mut u8;
    // Freed from main, which allocated nothing yet on this slot: this is
    // the foreign-thread path into the cached free list.
    engine.free(p);

    let threshold_probe = engine.allocate(16).expect("alloc after cross free");
    engine.free(threshold_probe);
}

/// S6: shrinking realloc keeps the same pointer; growing past the small
/// range into the large engine moves the object and preserves its prefix.
/// This one goes through the real `abi::realloc` entry point (the process-
/// wide default-config engine) since the shrink-keeps-pointer behavior is
/// `realloc`'s contract, not something `Allocator::allocate`/`free` alone
/// can exercise.
#[test]
#[cfg(feature = "abi")]
fn s6_realloc_shrink_keeps_pointer_grow_moves_and_preserves_prefix() {
    use bastion_alloc::abi;
    use std::ffi::c_void;

    unsafe {
        let p = abi::malloc(100).cast::<u8>();
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0xAB, 100);

        let q = abi::realloc(p.cast::<c_void>(), 40).cast::<u8>();
        assert_eq!(p, q, "shrinking within the same class must not move the object");

        let large_threshold = bastion_alloc::Config::default().large_threshold;
        let r = abi::realloc(q.cast::<c_void>(), large_threshold + 1).cast::<u8>();
        assert_ne!(q, r, "growing past the small range must move the object");
        for i in 0..40 {
            assert_eq!(*r.add(i), 0xAB);
        }
        abi::free(r.cast::<c_void>());
    }
}
