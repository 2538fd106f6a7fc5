//! Tunable geometry knobs and the derived shift/mask table computed once at
//! heap bring-up.
//!
//! Every constant here has a literal counterpart in the upstream allocator's
//! `#define` table; defaults match it so behavior is unchanged unless a
//! caller opts into a different [`Config`].

use std::fmt;

/// Errors that can occur while validating a [`Config`] or bringing up the
/// arenas it describes.
#[derive(Debug)]
pub enum InitError {
    /// A value that the geometry algebra requires to be a power of two was not.
    NotPowerOfTwo {
        /// Name of the offending field, for diagnostics.
        field: &'static str,
        /// The offending value.
        value: usize,
    },
    /// `NUM_HEAPS` must be an integer multiple of `BAG_SET_SIZE`.
    HeapsNotMultipleOfBagSet {
        /// Configured `num_heaps`.
        num_heaps: usize,
        /// Configured `bag_set_size`.
        bag_set_size: usize,
    },
    /// The OS refused to create one of the two process-wide arenas.
    ArenaMapFailed {
        /// Which arena failed to map.
        arena: &'static str,
        /// The underlying OS error.
        source: std::io::Error,
    },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPowerOfTwo { field, value } => {
                write!(f, "{field} must be a power of two, got {value}")
            }
            Self::HeapsNotMultipleOfBagSet {
                num_heaps,
                bag_set_size,
            } => write!(
                f,
                "num_heaps ({num_heaps}) must be a multiple of bag_set_size ({bag_set_size})"
            ),
            Self::ArenaMapFailed { arena, source } => {
                write!(f, "failed to map {arena} arena: {source}")
            }
        }
    }
}

impl std::error::Error for InitError {}

const fn is_pow2(x: usize) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

const fn log2(x: usize) -> u32 {
    (usize::BITS - 1) - x.leading_zeros()
}

/// Allocator geometry configuration.
///
/// Defaults reproduce the upstream allocator's non-`MANYBAGS` build: a
/// 16-class ladder from 16 B up to a 4 MiB bag, 128 thread slots, four
/// parallel heap replicas per bag.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Smallest size class, in bytes. Must be a power of two.
    pub min_block: usize,
    /// Number of size classes per sub-heap. Must be a power of two.
    pub num_bags: usize,
    /// Bytes per bag. Must be a power of two and at least `min_block`.
    pub bag_size: usize,
    /// Maximum thread slots the registry can hand out.
    pub num_subheaps: usize,
    /// Number of parallel heap replicas (the "bag set" fan-out).
    pub bag_set_size: usize,
    /// Relative weight of a bump-pointer draw against a free-list draw in
    /// the bag-set randomizer; `bag_set_size * bag_set_weight` is the
    /// reciprocal of the bump-pointer bias probability.
    pub bag_set_weight: usize,
    /// Total number of heap replicas in the arena. Must be a multiple of
    /// `bag_set_size`.
    pub num_heaps: usize,
    /// Requests strictly larger than this go to the large-object engine.
    pub large_threshold: usize,
    /// Ratio used to size the cached-free-list drain threshold:
    /// `drain_at = objects_in_bag / cached_freelist_ratio`.
    pub cached_freelist_ratio: usize,
    /// Probability (0.0–1.0) that a page-boundary bump-pointer crossing
    /// installs a random intra-bag guard page.
    pub random_guard_prop: f64,
    /// Number of in-use neighbor canaries to additionally verify on free.
    pub canary_neighbors: usize,
    /// Zero object bodies on free (`classSize <= 2 KiB` objects only).
    pub destroy_on_free: bool,
    /// Reserve a trailing canary byte in every small object and check it on free.
    pub canary: bool,
    /// Install a trailing guard page at the end of every bag replica.
    pub guard_pages: bool,
    /// Additionally install randomized intra-bag guard pages (see `random_guard_prop`).
    pub random_guard: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_block: 16,
            num_bags: 16,
            bag_size: 0x0040_0000, // 4 MiB
            num_subheaps: 128,
            bag_set_size: 4,
            bag_set_weight: 8,
            num_heaps: 1024,
            large_threshold: 0x0008_0000, // 512 KiB
            cached_freelist_ratio: 10,
            random_guard_prop: 0.1,
            canary_neighbors: 2,
            destroy_on_free: false,
            canary: cfg!(feature = "canary"),
            guard_pages: cfg!(feature = "guard-pages"),
            random_guard: cfg!(feature = "guard-pages"),
        }
    }
}

impl Config {
    /// A configuration scaled down for tests and examples: the same shape
    /// as [`Config::default`] but with a far smaller arena, so bringing up
    /// the heap does not require reserving terabytes of address space.
    #[must_use]
    pub fn small_for_tests() -> Self {
        Self {
            min_block: 16,
            num_bags: 8,        // classes: 16 B .. 2 KiB
            bag_size: 0x0001_0000, // 64 KiB
            num_subheaps: 8,
            bag_set_size: 2,
            bag_set_weight: 4,
            num_heaps: 8,
            large_threshold: 0x0002_0000, // 128 KiB
            cached_freelist_ratio: 4,
            random_guard_prop: 0.1,
            canary_neighbors: 2,
            destroy_on_free: false,
            canary: false,
            guard_pages: true,
            random_guard: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), InitError> {
        for (field, value) in [
            ("min_block", self.min_block),
            ("num_bags", self.num_bags),
            ("bag_size", self.bag_size),
            ("bag_set_size", self.bag_set_size),
            ("num_heaps", self.num_heaps),
        ] {
            if !is_pow2(value) {
                return Err(InitError::NotPowerOfTwo { field, value });
            }
        }
        if self.num_heaps % self.bag_set_size != 0 {
            return Err(InitError::HeapsNotMultipleOfBagSet {
                num_heaps: self.num_heaps,
                bag_set_size: self.bag_set_size,
            });
        }
        Ok(())
    }

    pub(crate) const fn first_bag_power(&self) -> u32 {
        log2(self.min_block)
    }

    pub(crate) const fn bag_shift(&self) -> u32 {
        log2(self.bag_size)
    }

    /// Highest usable size-class index: the last class whose size does not
    /// exceed `min(bag_size, large_threshold)`.
    pub(crate) fn last_usable_class(&self) -> usize {
        let ceiling = self.bag_size.min(self.large_threshold);
        let mut k = 0;
        while (self.min_block << (k + 1)) <= ceiling && k + 1 < self.num_bags {
            k += 1;
        }
        k
    }

    pub(crate) const fn sub_heap_size(&self) -> usize {
        self.num_bags * self.bag_size
    }

    pub(crate) const fn heap_size(&self) -> usize {
        self.sub_heap_size() * self.num_subheaps
    }

    pub(crate) const fn heap_shift(&self) -> u32 {
        log2(self.heap_size())
    }

    pub(crate) const fn sub_heap_shift(&self) -> u32 {
        log2(self.sub_heap_size())
    }

    pub(crate) const fn arena_size(&self) -> usize {
        self.heap_size() * self.num_heaps
    }

    pub(crate) const fn bag_set_randomizer(&self) -> usize {
        self.bag_set_size * self.bag_set_weight
    }
}
