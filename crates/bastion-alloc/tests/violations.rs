//! Process-isolated crash tests for the security properties that can only
//! be observed by the process going down: invariants 7 and 8 (guard-page
//! and canary enforcement), double free, and free of an unrecognized
//! pointer. Each test re-execs its own test binary filtered to just itself,
//! with an environment variable marking the child; the child performs the
//! violation directly (which aborts it), and the parent asserts the child
//! died from `SIGABRT` rather than exiting normally.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};

const CHILD_MARKER: &str = "BASTION_ALLOC_CRASH_CHILD";

fn is_child() -> bool {
    std::env::var_os(CHILD_MARKER).is_some()
}

/// Re-execs the current test binary filtered down to `test_name`, with
/// [`CHILD_MARKER`] set, and asserts the child process aborted.
fn expect_child_abort(test_name: &str) {
    let exe = std::env::current_exe().expect("current_exe");
    let output = Command::new(exe)
        .arg(test_name)
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MARKER, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .expect("spawn child test process");

    let signal = output.status.signal();
    assert_eq!(
        signal,
        Some(libc::SIGABRT),
        "expected child to abort with SIGABRT, got status {:?}",
        output.status
    );
}

fn deterministic_config() -> bastion_alloc::Config {
    let mut cfg = bastion_alloc::Config::small_for_tests();
    cfg.canary = false;
    cfg.guard_pages = false;
    cfg.random_guard = false;
    cfg.bag_set_size = 1;
    cfg
}

/// S2's second half: freeing the same small object twice aborts.
#[test]
fn double_free_of_small_object_aborts() {
    if !is_child() {
        expect_child_abort("double_free_of_small_object_aborts");
        return;
    }
    let engine = bastion_alloc::Allocator::new(deterministic_config()).expect("init");
    let p = engine.allocate(24).expect("alloc");
    engine.free(p);
    engine.free(p);
}

/// S3's second half: freeing the same large object twice aborts.
#[test]
fn double_free_of_large_object_aborts() {
    if !is_child() {
        expect_child_abort("double_free_of_large_object_aborts");
        return;
    }
    let engine = bastion_alloc::Allocator::new(deterministic_config()).expect("init");
    let threshold = engine.config().large_threshold;
    let p = engine.allocate(threshold + 1).expect("alloc");
    engine.free(p);
    engine.free(p);
}

/// Freeing a pointer the engine never handed out aborts, regardless of
/// whether it looks like it could plausibly live in the heap arena.
#[test]
fn free_of_unknown_pointer_aborts() {
    if !is_child() {
        expect_child_abort("free_of_unknown_pointer_aborts");
        return;
    }
    let engine = bastion_alloc::Allocator::new(deterministic_config()).expect("init");
    let mut stack_value = 0u8;
    engine.free(std::ptr::addr_of_mut!(stack_value));
}

/// Invariant 8: overwriting an object's trailing canary byte and then
/// freeing it aborts.
#[test]
fn canary_violation_aborts() {
    if !is_child() {
        expect_child_abort("canary_violation_aborts");
        return;
    }
    let mut cfg = deterministic_config();
    cfg.canary = true;
    let engine = bastion_alloc::Allocator::new(cfg).expect("init");
    let p = engine.allocate(24).expect("alloc");
    let usable = engine.usable_size(p).expect("usable");
    unsafe {
        // The canary occupies the byte just past the usable range.
        p.add(usable).write(0x00);
    }
    engine.free(p);
}

/// Invariant 7: writing past the last object in a bag replica, into its
/// trailing guard page, raises SIGSEGV rather than SIGABRT — still
/// detected as a non-normal exit, by a different signal.
#[test]
fn guard_page_write_segfaults() {
    if !is_child() {
        let exe = std::env::current_exe().expect("current_exe");
        let output = Command::new(exe)
            .arg("guard_page_write_segfaults")
            .arg("--exact")
            .arg("--nocapture")
            .env(CHILD_MARKER, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .expect("spawn child test process");
        assert_eq!(
            output.status.signal(),
            Some(libc::SIGSEGV),
            "expected child to segfault on the guard page, got status {:?}",
            output.status
        );
        return;
    }

    let mut cfg = deterministic_config();
    cfg.guard_pages = true;
    let class_size = 32; // min_block(16) << 1
    let page_size = bastion_alloc_sys::page_size();
    let usable = if class_size < page_size {
        cfg.bag_size - page_size
    } else {
        cfg.bag_size - class_size
    };
    let objects_per_bag = usable / class_size;

    let engine = bastion_alloc::Allocator::new(cfg).expect("init");

    // The init-time guard install already protects the page right after
    // the last object of bag-set item 0's first replica, so exhausting
    // exactly that many objects of this class lands the next write on it.
    let mut last = std::ptr::null_mut();
    for _ in 0..objects_per_bag {
        last = engine.allocate(class_size - 8).expect("fill bag");
    }
    unsafe {
        last.add(class_size).write(0x41);
    }
}
