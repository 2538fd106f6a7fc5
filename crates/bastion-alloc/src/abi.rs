//! The C ABI facade: `malloc`/`free` and friends, exported with their libc
//! names so this crate can be preloaded ahead of the platform allocator.
//!
//! Every entry point here is a thin translation layer over
//! [`crate::Allocator`]; the only logic that belongs in this module is
//! argument validation the C APIs require (alignment, overflow) and the
//! reentrant-init fallback to [`crate::bootstrap`].

use std::cell::Cell;
use std::ffi::c_void;

use crate::{diagnostics, engine};

fn is_pow2(x: usize) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

thread_local! {
    // Guards against a thread reentering these entry points from inside a
    // call it is already making: the engine's own bookkeeping (the
    // `HashMap`s in `bigheap`/`thread_registry`) allocates through the
    // ordinary Rust global allocator, which resolves back to this same
    // `malloc` symbol once this library is preloaded. Without this guard
    // that nested call would try to reacquire a spinlock this thread
    // already holds and spin forever.
    static IN_ENGINE_CALL: Cell<bool> = const { Cell::new(false) };
}

struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        if IN_ENGINE_CALL.with(Cell::get) {
            None
        } else {
            IN_ENGINE_CALL.with(|f| f.set(true));
            Some(Self)
        }
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_ENGINE_CALL.with(|f| f.set(false));
    }
}

/// Allocates `size` bytes with no particular alignment guarantee beyond
/// what every size class already provides.
///
/// # Safety
/// Same contract as libc's `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(engine) = engine() else {
        return crate::bootstrap::alloc(size, 16).cast::<c_void>();
    };
    let Some(_guard) = ReentryGuard::enter() else {
        return crate::bootstrap::alloc(size, 16).cast::<c_void>();
    };
    engine.allocate(size).map_or(std::ptr::null_mut(), |p| p.cast::<c_void>())
}

/// Frees a pointer obtained from [`malloc`], [`calloc`], [`realloc`] or one
/// of the aligned allocation functions. A null pointer is a no-op. A
/// pointer served from the bootstrap arena (handed out before the engine
/// was up) is also a no-op, since that arena never reclaims memory.
///
/// # Safety
/// Same contract as libc's `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let byte_ptr = ptr.cast::<u8>();
    if crate::bootstrap::owns(byte_ptr) {
        return;
    }
    let Some(engine) = engine() else { return };
    let Some(_guard) = ReentryGuard::enter() else {
        return;
    };
    engine.free(byte_ptr);
}

/// Allocates `nmemb * size` bytes, zeroed. Returns null on overflow of
/// that product instead of wrapping, per the hardened contract.
///
/// # Safety
/// Same contract as libc's `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    let ptr = unsafe { malloc(total) };
    if !ptr.is_null() {
        unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, total) };
    }
    ptr
}

/// Resizes an allocation, preserving its contents up to the smaller of the
/// old and new sizes. `realloc(NULL, size)` behaves as `malloc(size)`;
/// `realloc(ptr, 0)` frees `ptr` and returns null.
///
/// # Safety
/// Same contract as libc's `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return unsafe { malloc(size) };
    }
    if size == 0 {
        unsafe { free(ptr) };
        return std::ptr::null_mut();
    }
    let byte_ptr = ptr.cast::<u8>();
    let Some(old_size) = engine().and_then(|e| e.usable_size(byte_ptr)) else {
        diagnostics::warn_unknown_realloc(byte_ptr as usize);
        return std::ptr::null_mut();
    };
    if old_size >= size {
        return ptr;
    }
    let new_ptr = unsafe { malloc(size) };
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    let copy_len = old_size.min(size);
    unsafe { std::ptr::copy_nonoverlapping(byte_ptr, new_ptr.cast::<u8>(), copy_len) };
    unsafe { free(ptr) };
    new_ptr
}

fn aligned_allocate(align: usize, size: usize) -> Option<*mut c_void> {
    if !is_pow2(align) || align % std::mem::size_of::<usize>() != 0 {
        return None;
    }
    let wanted = size.max(align);
    engine().and_then(|e| e.allocate(wanted)).map(|p| p.cast::<c_void>())
}

/// POSIX `posix_memalign`: writes an `align`-aligned pointer of `size`
/// bytes through `out` and returns `0`, or returns `EINVAL`/`ENOMEM`.
///
/// # Safety
/// `out` must be a valid, writable `*mut *mut c_void`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(out: *mut *mut c_void, align: usize, size: usize) -> libc::c_int {
    if !is_pow2(align) || align % std::mem::size_of::<usize>() != 0 {
        return libc::EINVAL;
    }
    match aligned_allocate(align, size) {
        Some(ptr) => {
            unsafe { *out = ptr };
            0
        }
        None => libc::ENOMEM,
    }
}

/// Obsolete glibc alignment API, kept for binaries that still call it.
///
/// # Safety
/// Same contract as glibc's `memalign`.
#[no_mangle]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    aligned_allocate(align, size).unwrap_or(std::ptr::null_mut())
}

/// Allocates `size` bytes aligned to the system page size.
///
/// # Safety
/// Same contract as the legacy `valloc`.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    aligned_allocate(bastion_alloc_sys::page_size(), size).unwrap_or(std::ptr::null_mut())
}

/// Allocates `size` bytes rounded up to a whole number of pages, page
/// aligned.
///
/// # Safety
/// Same contract as the legacy `pvalloc`.
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let page = bastion_alloc_sys::page_size();
    let rounded = (size + page - 1) & !(page - 1);
    aligned_allocate(page, rounded).unwrap_or(std::ptr::null_mut())
}

/// C11 `aligned_alloc`: like [`memalign`], with the additional contract
/// that `size` be a multiple of `align`; callers that violate it still get
/// a correctly aligned (if oversized) allocation back rather than UB.
///
/// # Safety
/// Same contract as libc's `aligned_alloc`.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    aligned_allocate(align, size).unwrap_or(std::ptr::null_mut())
}

/// `alloca` cannot be implemented as an ordinary function call: the memory
/// it returns must live in the *caller's* stack frame, which requires
/// compiler support (inlining the stack-pointer adjustment), not a
/// library symbol. Binaries that call the real libc `alloca` never go
/// through this symbol table at all; this stub exists only so linking
/// against a static binary that references it does not fail, and it is
/// not expected to be called.
///
/// # Safety
/// Must not actually be called; see above.
#[no_mangle]
pub unsafe extern "C" fn alloca(_size: usize) -> *mut c_void {
    diagnostics::warn_unsupported("alloca");
    std::ptr::null_mut()
}

/// Returns the usable size of a live allocation, or `usize::MAX` (the `-1`
/// sentinel malloc extensions use) if `ptr` is not one this allocator
/// recognizes.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this module.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    engine().and_then(|e| e.usable_size(ptr.cast::<u8>())).unwrap_or(usize::MAX)
}

struct ThreadBoot {
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
}

extern "C" fn trampoline(raw: *mut c_void) -> *mut c_void {
    let boot = unsafe { Box::from_raw(raw.cast::<ThreadBoot>()) };
    if let Some(engine) = engine() {
        engine.register_thread(unsafe { libc::pthread_self() });
    }
    (boot.start_routine)(boot.arg)
}

/// Intercepts thread creation so every new thread registers a slot before
/// running its real start routine.
///
/// # Safety
/// Same contract as libc's `pthread_create`.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
) -> libc::c_int {
    let boot = Box::new(ThreadBoot { start_routine, arg });
    let raw = Box::into_raw(boot).cast::<c_void>();
    unsafe { crate::real::pthread_create(thread, attr, trampoline, raw) }
}

/// Intercepts thread joining so a joined thread's slot is released back to
/// the registry.
///
/// # Safety
/// Same contract as libc's `pthread_join`.
#[no_mangle]
pub unsafe extern "C" fn pthread_join(thread: libc::pthread_t, retval: *mut *mut c_void) -> libc::c_int {
    let result = unsafe { crate::real::pthread_join(thread, retval) };
    if result == 0 {
        if let Some(engine) = engine() {
            engine.release_thread(thread);
        } else {
            diagnostics::warn_untracked_join();
        }
    }
    result
}
