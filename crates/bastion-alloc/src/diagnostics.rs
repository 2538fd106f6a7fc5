//! Fatal-violation reporting and non-fatal diagnostics.
//!
//! Every security violation this allocator can detect terminates the
//! process; none of it is surfaced to the caller as a `Result`, by
//! contract. This module is the single place that decides how a violation
//! is reported before the process goes down, so the rest of the crate
//! just calls [`fatal`].

use std::backtrace::Backtrace;

/// A detected security violation. Carries just enough context to produce a
/// useful diagnostic; there is deliberately no `Result`-returning path for
/// these because callers cannot recover from them.
#[derive(Debug)]
pub enum Violation {
    DoubleOrInvalidFree { addr: usize },
    MisalignedFree { addr: usize },
    UnknownPointerFree { addr: usize },
    CanaryViolation { addr: usize, neighbor: bool },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DoubleOrInvalidFree { addr } => {
                write!(f, "double or invalid free of {addr:#x}")
            }
            Self::MisalignedFree { addr } => {
                write!(f, "free of misaligned pointer {addr:#x}")
            }
            Self::UnknownPointerFree { addr } => {
                write!(f, "free of unknown pointer {addr:#x}")
            }
            Self::CanaryViolation { addr, neighbor } => {
                if *neighbor {
                    write!(f, "canary violation in neighbor of {addr:#x}")
                } else {
                    write!(f, "canary violation on {addr:#x}")
                }
            }
        }
    }
}

fn emit_error(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::error!("{msg}");
    #[cfg(not(feature = "tracing"))]
    eprintln!("bastion-alloc: {msg}");
}

fn emit_warn(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::warn!("{msg}");
    #[cfg(not(feature = "tracing"))]
    eprintln!("bastion-alloc: warning: {msg}");
}

/// Reports `violation` with a captured backtrace and aborts the process.
///
/// This function never returns. Not signal-safe: it allocates (for the
/// backtrace) and may write to stderr; never call it from a signal handler.
pub fn fatal(violation: &Violation) -> ! {
    let backtrace = Backtrace::force_capture();
    emit_error(&format!("{violation}\n{backtrace}"));
    std::process::abort();
}

/// Logs a non-fatal diagnostic (e.g. `realloc` of an unknown pointer, an
/// unsupported API stub being called) at `warn` level.
pub fn warn_unsupported(api: &str) {
    emit_warn(&format!("{api} is not supported and returned NULL"));
}

/// Logs a non-fatal diagnostic for a `realloc` called with an address this
/// allocator does not recognize.
pub fn warn_unknown_realloc(addr: usize) {
    emit_warn(&format!("realloc called with unknown pointer {addr:#x}"));
}

/// Logs a non-fatal diagnostic for a join on an untracked thread id.
pub fn warn_untracked_join() {
    emit_warn("pthread_join on a thread id the registry never recorded");
}
