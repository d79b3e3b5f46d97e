use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the storage engine and the retrieval coordinator.
///
/// The defaults mirror production sizing: groups cap out a little under
/// 6 GiB, the block cache budgets 512 MiB assuming 256 KiB blocks, and the
/// top CAR fans out 2048 links per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum payload bytes committed to a single group.
    pub max_group_size: u64,
    /// Maximum number of blocks committed to a single group.
    pub max_group_blocks: u64,
    /// Fan-out of the layered top CAR built over a sealed group.
    pub arity: usize,
    /// Retrieval block cache budget in bytes.
    pub block_cache_bytes: usize,
    /// Assumed average block size; `block_cache_bytes / avg_block_size`
    /// bounds the cache entry count.
    pub avg_block_size: usize,
    /// Capacity of the background task queue.
    pub task_queue_len: usize,
    /// Overall timeout for one HTTP gateway fetch.
    pub http_timeout: Duration,
    /// Global timeout for one graph-protocol fetch across all attempts.
    pub graph_global_timeout: Duration,
    /// Per-provider timeout within a graph-protocol fetch.
    pub graph_provider_timeout: Duration,
    /// Maximum graph-protocol attempts per hash.
    pub graph_attempts: usize,
    /// Number of candidate providers handed to the fetch passes.
    pub candidate_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_group_size: 6000 << 20,
            max_group_blocks: 20 << 20,
            arity: 2048,
            block_cache_bytes: 512 << 20,
            avg_block_size: 256 << 10,
            task_queue_len: 16,
            http_timeout: Duration::from_secs(30),
            graph_global_timeout: Duration::from_secs(30),
            graph_provider_timeout: Duration::from_secs(4),
            graph_attempts: 16,
            candidate_limit: 6,
        }
    }
}

impl Config {
    pub(crate) fn cache_entries(&self) -> usize {
        (self.block_cache_bytes / self.avg_block_size).max(1)
    }
}
