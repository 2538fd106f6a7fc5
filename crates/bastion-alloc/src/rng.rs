//! A small per-thread xorshift64* generator used only for the bag-set
//! selection draw in the allocation hot path.
//!
//! This is explicitly not a cryptographic PRNG: the upstream design notes
//! call for a selectable source among "a vectorized PRNG, the platform's
//! secure random, or the standard PRNG", optimized for speed over an
//! adversarial model (the security properties of this allocator come from
//! guard pages, canaries and shadow-metadata checks, not from the
//! unpredictability of bag-set selection). Each thread seeds its own
//! generator once from a single process-wide seed drawn from OS entropy.

use std::cell::Cell;
use std::sync::OnceLock;

fn process_seed() -> u64 {
    static SEED: OnceLock<u64> = OnceLock::new();
    *SEED.get_or_init(|| {
        #[cfg(unix)]
        {
            use std::io::Read;
            let mut buf = [0u8; 8];
            if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
                if f.read_exact(&mut buf).is_ok() {
                    return u64::from_ne_bytes(buf);
                }
            }
        }
        // Fallback: address-space layout is itself randomized (ASLR), so
        // the address of a stack local is a usable, if weak, seed source.
        let fallback = &buf_fallback as *const _ as u64;
        fallback ^ 0x9E37_79B9_7F4A_7C15
    })
}

fn buf_fallback() {}

#[derive(Clone, Copy)]
struct XorShift64Star(u64);

impl XorShift64Star {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

thread_local! {
    static RNG: Cell<XorShift64Star> = Cell::new(XorShift64Star(seed_for_this_thread()));
}

fn seed_for_this_thread() -> u64 {
    let tid_mix = {
        #[cfg(unix)]
        {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        }
        #[cfg(not(unix))]
        {
            0
        }
    };
    let seed = process_seed() ^ tid_mix.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    if seed == 0 {
        0xDEAD_BEEF_CAFE_F00D
    } else {
        seed
    }
}

/// Draws the next pseudo-random word for the current thread.
#[must_use]
pub fn next_word() -> u64 {
    RNG.with(|cell| {
        let mut rng = cell.get();
        let v = rng.next();
        cell.set(rng);
        v
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_varying_output() {
        let a = next_word();
        let b = next_word();
        assert_ne!(a, b);
    }
}
