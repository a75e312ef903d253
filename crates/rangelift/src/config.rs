//! Restore configuration.
//!
//! One explicit struct, no globals; constructors thread it through every
//! coordinator. The split limits are tunable so tests can shrink batches to
//! observable sizes.

use std::time::Duration;

/// Default region split size budget, 96 MiB.
pub const DEFAULT_MERGE_REGION_SIZE_BYTES: u64 = 96 * 1024 * 1024;
/// Default region key-count budget.
pub const DEFAULT_MERGE_REGION_KEY_COUNT: u64 = 960_000;

/// Tunables for the whole restore pipeline.
#[derive(Clone, Debug)]
pub struct RestoreConfig {
    /// Planner budget: max merged-range bytes per region.
    pub merge_region_size_bytes: u64,
    /// Planner budget: max merged-range keys per region.
    pub merge_region_key_count: u64,

    /// Upper bound on keys per batch-split RPC.
    pub max_batch_split_keys: usize,
    /// Upper bound on the summed key bytes per batch-split RPC, so one
    /// request stays under the cluster's raft entry limit.
    pub max_batch_split_size: usize,
    /// Base for the split retry exponential backoff.
    pub split_region_base_backoff: Duration,
    /// Rounds of scan + split before a region split is declared failed.
    pub split_retry_limit: usize,
    /// Concurrent per-region split workers.
    pub split_concurrency: usize,

    /// How long to wait for one scatter operator to reach a terminal state.
    pub scatter_wait_limit: Duration,

    /// Concurrent file import workers.
    pub importer_concurrency: usize,
    /// Rounds of scan + download + ingest before a file import fails.
    pub import_retry_limit: usize,

    /// Regions fetched per scan round-trip.
    pub scan_region_page_size: usize,

    /// KV pairs per write-stream chunk.
    pub batch_write_kv_pairs: usize,
    /// Buffered row-change pairs that force a flush in log restore.
    pub batch_flush_kv_pairs: usize,
    /// Buffered row-change bytes that force a flush in log restore.
    pub batch_flush_kv_size: u64,

    /// Per-store download rate limit; 0 disables.
    pub rate_limit_bytes_per_sec: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            merge_region_size_bytes: DEFAULT_MERGE_REGION_SIZE_BYTES,
            merge_region_key_count: DEFAULT_MERGE_REGION_KEY_COUNT,
            max_batch_split_keys: 4096,
            max_batch_split_size: 1 << 20,
            split_region_base_backoff: Duration::from_millis(10),
            split_retry_limit: 8,
            split_concurrency: 4,
            scatter_wait_limit: Duration::from_secs(180),
            importer_concurrency: 128,
            import_retry_limit: 8,
            scan_region_page_size: 128,
            batch_write_kv_pairs: 4096,
            batch_flush_kv_pairs: 32 * 1024,
            batch_flush_kv_size: 32 * 1024 * 1024,
            rate_limit_bytes_per_sec: 0,
        }
    }
}
