//! Read-only statistics over the cache, the sync queue and connectivity.

use serde::Serialize;

use crate::cache::CacheLayer;
use crate::connectivity::ConnectivityMonitor;
use crate::error::StorageResult;
use crate::sync::SyncQueue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  #[serde(rename = "fastTierSizeKB")]
  pub fast_tier_size_kb: u64,
  #[serde(rename = "bulkTierSizeKB")]
  pub bulk_tier_size_kb: u64,
  #[serde(rename = "totalSizeKB")]
  pub total_size_kb: u64,
  pub pending_sync_jobs: usize,
  pub failed_sync_jobs: usize,
  pub is_online: bool,
  pub engine_version: String,
}

fn to_kb(bytes: u64) -> u64 {
  bytes.div_ceil(1024)
}

/// Snapshot of the current state. Nothing is cached between calls.
pub fn collect(
  cache: &CacheLayer,
  queue: &SyncQueue,
  connectivity: &ConnectivityMonitor,
) -> StorageResult<CacheStats> {
  let sizes = cache.tier_sizes()?;
  Ok(CacheStats {
    fast_tier_size_kb: to_kb(sizes.fast_bytes),
    bulk_tier_size_kb: to_kb(sizes.bulk_bytes),
    total_size_kb: to_kb(sizes.fast_bytes + sizes.bulk_bytes),
    pending_sync_jobs: queue.len(),
    failed_sync_jobs: queue.failed_count(),
    is_online: connectivity.is_online(),
    engine_version: cache.engine_version().to_string(),
  })
}
