//! NUMA-awareness hooks (§9 Design Notes: "treat as optional hooks that may be null").
//!
//! This crate performs no NUMA topology detection itself; that is explicitly out of scope (§1).
//! What it does provide is the two seams a NUMA-aware embedder needs: a per-node allocation hint
//! for a cache/gc-set's backing storage, and a per-worker affinity hook run once at thread
//! startup. Both default to doing nothing.

/// A per-node allocation hint. Given a requested byte length and a preferred NUMA node, returns
/// a freshly allocated, zero-initialized buffer. The default implementation ignores `node` and
/// falls back to a plain heap allocation; embedders on NUMA hardware can override this via
/// [`crate::config::SchedulerConfig`]-adjacent hooks to pin pages to a node with `libnuma` or
/// similar, without this crate depending on such a library itself.
pub fn allocate_on_node(len: usize, _node: Option<usize>) -> Vec<u8> {
    vec![0u8; len]
}

/// Binds the calling thread to a NUMA node. No-op by default; see
/// [`crate::config::SchedulerConfig::with_bind_worker_to_node`] for how a scheduler invokes a
/// caller-supplied version of this per worker thread.
pub fn bind_worker_to_node(_worker_index: usize, _node: Option<usize>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_on_node_returns_zeroed_buffer_of_requested_len() {
        let buf = allocate_on_node(64, None);
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
