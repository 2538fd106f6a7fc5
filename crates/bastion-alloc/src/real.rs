//! Resolves the libc symbols this crate's ABI shadows, via
//! `dlsym(RTLD_NEXT, ...)`, so the `pthread_create`/`pthread_join` hooks in
//! [`crate::abi`] can still call through to the platform's real
//! implementation.
//!
//! Nothing here needs the *real* `malloc`/`free`: this allocator is a
//! full replacement, not an interposing wrapper around glibc's, so only
//! the pthread entry points need a real symbol behind them.

use std::sync::OnceLock;

type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
    *mut libc::c_void,
) -> libc::c_int;

type PthreadJoinFn = unsafe extern "C" fn(libc::pthread_t, *mut *mut libc::c_void) -> libc::c_int;

struct RealSymbols {
    pthread_create: PthreadCreateFn,
    pthread_join: PthreadJoinFn,
}

// SAFETY: the resolved function pointers are plain code addresses, valid
// for the lifetime of the process and safely callable from any thread.
unsafe impl Send for RealSymbols {}
unsafe impl Sync for RealSymbols {}

fn resolve() -> RealSymbols {
    unsafe fn lookup(name: &str) -> *mut libc::c_void {
        let cname = std::ffi::CString::new(name).expect("symbol name has no interior NUL");
        let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
        if ptr.is_null() {
            diagnostics_fatal_missing_symbol(name);
        }
        ptr
    }

    #[cold]
    fn diagnostics_fatal_missing_symbol(name: &str) -> ! {
        eprintln!("bastion-alloc: could not resolve real symbol `{name}` via dlsym(RTLD_NEXT)");
        std::process::abort();
    }

    unsafe {
        RealSymbols {
            pthread_create: std::mem::transmute::<*mut libc::c_void, PthreadCreateFn>(lookup("pthread_create")),
            pthread_join: std::mem::transmute::<*mut libc::c_void, PthreadJoinFn>(lookup("pthread_join")),
        }
    }
}

fn symbols() -> &'static RealSymbols {
    static SYMBOLS: OnceLock<RealSymbols> = OnceLock::new();
    SYMBOLS.get_or_init(resolve)
}

/// # Safety
/// Same contract as `pthread_create(3)`.
pub unsafe fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
    arg: *mut libc::c_void,
) -> libc::c_int {
    unsafe { (symbols().pthread_create)(thread, attr, start_routine, arg) }
}

/// # Safety
/// Same contract as `pthread_join(3)`.
pub unsafe fn pthread_join(thread: libc::pthread_t, retval: *mut *mut libc::c_void) -> libc::c_int {
    unsafe { (symbols().pthread_join)(thread, retval) }
}
