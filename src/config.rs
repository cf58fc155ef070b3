//! Builder-style configuration for the three engines (§4.5).
//!
//! None of these types perform I/O: reading `RUST_LOG`, environment overrides, or config files
//! is the embedding binary's job. These structs only hold the numbers the engines need and
//! provide sane, documented defaults.

use std::num::NonZeroUsize;

/// Width of a cache line's worth of `u32` slots used for confined probing (§3, §4.2, §4.3).
pub const CACHE_LINE_SLOTS: usize = 16;

/// Configuration for the work-stealing [`crate::scheduler::Scheduler`].
#[derive(Copy, Clone, Debug)]
pub struct SchedulerConfig {
    workers: usize,
    deque_size: usize,
    /// Number of neighbor workers a thief scans linearly before falling back to a fully random
    /// pick (§4.4 "Hybrid" victim selection, "a small range, e.g. 0-39").
    pub(crate) linear_scan_width: usize,
    /// Number of leapfrog attempts before issuing one random steal elsewhere (§4.4, "e.g. 32").
    pub(crate) leapfrog_patience: u32,
    /// Optional hook invoked once per spawned worker thread before it enters its run loop.
    /// `None` by default; NUMA-aware embedders can bind the calling thread to a node here.
    pub(crate) bind_worker_to_node: Option<fn(worker_index: usize)>,
}

impl SchedulerConfig {
    pub const DEFAULT_DEQUE_SIZE: usize = 4096;
    pub const DEFAULT_LINEAR_SCAN_WIDTH: usize = 40;
    pub const DEFAULT_LEAPFROG_PATIENCE: u32 = 32;

    /// Builds a configuration defaulted to `std::thread::available_parallelism()` workers (or
    /// `1` if the platform cannot tell us, which `available_parallelism` itself guarantees is
    /// never zero).
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        SchedulerConfig {
            workers,
            deque_size: Self::DEFAULT_DEQUE_SIZE,
            linear_scan_width: Self::DEFAULT_LINEAR_SCAN_WIDTH,
            leapfrog_patience: Self::DEFAULT_LEAPFROG_PATIENCE,
            bind_worker_to_node: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        assert!(workers >= 1, "a scheduler needs at least one worker");
        self.workers = workers;
        self
    }

    pub fn with_deque_size(mut self, deque_size: usize) -> Self {
        assert!(
            deque_size.is_power_of_two() && deque_size >= 2,
            "deque size must be a power of two >= 2"
        );
        self.deque_size = deque_size;
        self
    }

    pub fn with_linear_scan_width(mut self, width: usize) -> Self {
        self.linear_scan_width = width;
        self
    }

    pub fn with_leapfrog_patience(mut self, patience: u32) -> Self {
        self.leapfrog_patience = patience;
        self
    }

    /// Registers a NUMA/affinity hook run once per worker thread at startup. Out of scope per
    /// §1 beyond this optional seam: the crate performs no NUMA detection itself.
    pub fn with_bind_worker_to_node(mut self, hook: fn(worker_index: usize)) -> Self {
        self.bind_worker_to_node = Some(hook);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn deque_size(&self) -> usize {
        self.deque_size
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for an [`crate::cache::LLCache`].
#[derive(Copy, Clone, Debug)]
pub struct CacheConfig {
    capacity: usize,
}

impl CacheConfig {
    pub const DEFAULT_CAPACITY: usize = 1 << 20;

    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= CACHE_LINE_SLOTS,
            "cache capacity must be a power of two >= {CACHE_LINE_SLOTS}"
        );
        CacheConfig { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Configuration for an [`crate::gcset::LLGCSet`].
#[derive(Copy, Clone, Debug)]
pub struct GcSetConfig {
    capacity: usize,
    rehash_threshold: u32,
}

impl GcSetConfig {
    pub const DEFAULT_CAPACITY: usize = 1 << 20;

    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= CACHE_LINE_SLOTS,
            "gc-set capacity must be a power of two >= {CACHE_LINE_SLOTS}"
        );
        // threshold ~= 2 * log2(capacity), per §4.3.
        let rehash_threshold = 2 * (usize::BITS - capacity.leading_zeros());
        GcSetConfig {
            capacity,
            rehash_threshold,
        }
    }

    pub fn with_rehash_threshold(mut self, threshold: u32) -> Self {
        assert!(threshold >= 1);
        self.rehash_threshold = threshold;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rehash_threshold(&self) -> u32 {
        self.rehash_threshold
    }
}

impl Default for GcSetConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_default_has_at_least_one_worker() {
        assert!(SchedulerConfig::default().workers() >= 1);
    }

    #[test]
    fn cache_config_rejects_non_power_of_two() {
        let result = std::panic::catch_unwind(|| CacheConfig::new(100));
        assert!(result.is_err());
    }

    #[test]
    fn gc_set_threshold_grows_with_capacity() {
        let small = GcSetConfig::new(16).rehash_threshold();
        let large = GcSetConfig::new(1 << 20).rehash_threshold();
        assert!(large > small);
    }
}
