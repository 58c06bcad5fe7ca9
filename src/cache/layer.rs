//! Tiered cache store: routes entries between the fast and bulk tiers and
//! enforces the validity policy on every read.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::policy::{is_valid, TtlPolicy};
use super::traits::{select_tier, CacheEntry, CacheOptions, StorageTier, TierKind};
use crate::clock::Clock;
use crate::error::{StorageError, StorageResult};

/// Outcome of a full validity sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  /// Entries inspected across both tiers
  pub scanned: usize,
  /// Entries evicted because they failed the validity policy
  pub removed: usize,
  /// Evictions that failed at the storage level
  pub failed: usize,
}

/// Bytes currently held by each tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSizes {
  pub fast_bytes: u64,
  pub bulk_bytes: u64,
}

/// Per-key async locks. Entries are pruned once nobody holds or waits on them.
#[derive(Default)]
struct KeyLocks {
  locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
  async fn run<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
      Arc::clone(locks.entry(key.to_string()).or_default())
    };

    let result = {
      let _guard = lock.lock().await;
      f()
    };

    drop(lock);
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    if locks
      .get(key)
      .is_some_and(|held| Arc::strong_count(held) == 1)
    {
      locks.remove(key);
    }
    result
  }
}

/// Key/value cache spread over a fast small-object tier and a bulk tier.
///
/// Each key lives in exactly one tier, chosen at write time by the entry's
/// serialized size. Writes and evictions on the same key are serialized;
/// reads never block.
pub struct CacheLayer {
  fast: Arc<dyn StorageTier>,
  bulk: Arc<dyn StorageTier>,
  policy: TtlPolicy,
  engine_version: String,
  tier_threshold: usize,
  clock: Arc<dyn Clock>,
  locks: KeyLocks,
}

impl CacheLayer {
  pub fn new(
    fast: Arc<dyn StorageTier>,
    bulk: Arc<dyn StorageTier>,
    policy: TtlPolicy,
    engine_version: impl Into<String>,
    tier_threshold: usize,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      fast,
      bulk,
      policy,
      engine_version: engine_version.into(),
      tier_threshold,
      clock,
      locks: KeyLocks::default(),
    }
  }

  pub fn engine_version(&self) -> &str {
    &self.engine_version
  }

  pub fn policy(&self) -> &TtlPolicy {
    &self.policy
  }

  fn tier(&self, kind: TierKind) -> &Arc<dyn StorageTier> {
    match kind {
      TierKind::Fast => &self.fast,
      TierKind::Bulk => &self.bulk,
    }
  }

  fn is_entry_valid(&self, entry: &CacheEntry) -> bool {
    is_valid(entry, &self.engine_version, self.clock.now(), &self.policy)
  }

  /// Serialize `value` and store it under `key`, replacing any prior entry.
  pub async fn put<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    options: CacheOptions,
  ) -> StorageResult<()> {
    let data = serde_json::to_value(value).map_err(|source| StorageError::Serialization {
      key: key.to_string(),
      source,
    })?;
    self.put_value(key, data, options).await
  }

  /// Store an already-built JSON value under `key`.
  pub async fn put_value(
    &self,
    key: &str,
    data: serde_json::Value,
    options: CacheOptions,
  ) -> StorageResult<()> {
    let entry = CacheEntry {
      key: key.to_string(),
      data,
      timestamp: self.clock.now(),
      version: self.engine_version.clone(),
      priority: options.priority,
      tags: options.tags,
      ttl_override_ms: options.ttl_override.map(|d| d.num_milliseconds()),
    };
    let bytes = serde_json::to_vec(&entry).map_err(|source| StorageError::Serialization {
      key: key.to_string(),
      source,
    })?;

    let kind = select_tier(bytes.len(), self.tier_threshold);
    let (target, other) = match kind {
      TierKind::Fast => (&self.fast, &self.bulk),
      TierKind::Bulk => (&self.bulk, &self.fast),
    };

    self
      .locks
      .run(key, || {
        // Clear the other tier first so a failed write never leaves two copies
        other.delete(key)?;
        target.put(key, &bytes)
      })
      .await?;

    debug!(key, tier = target.name(), bytes = bytes.len(), "cached entry");
    Ok(())
  }

  /// Fetch and decode a value. Missing, expired, outdated and corrupt
  /// entries all read as `None`.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.get_entry(key).await?;
    match serde_json::from_value(entry.data) {
      Ok(value) => Some(value),
      Err(e) => {
        debug!(key, error = %e, "cached entry does not match requested type");
        None
      }
    }
  }

  /// Fetch the full entry for `key` if it is still valid.
  ///
  /// Invalid or unparseable entries are evicted as a side effect.
  pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
    for kind in [TierKind::Fast, TierKind::Bulk] {
      let tier = self.tier(kind);
      let bytes = match tier.get(key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => continue,
        Err(e) => {
          warn!(key, tier = tier.name(), error = %e, "cache read failed");
          continue;
        }
      };

      match serde_json::from_slice::<CacheEntry>(&bytes) {
        Ok(entry) if self.is_entry_valid(&entry) => {
          debug!(key, tier = tier.name(), "cache hit");
          return Some(entry);
        }
        Ok(entry) => {
          if entry.version != self.engine_version {
            debug!(key, version = %entry.version, "cache entry from another engine version");
          } else {
            debug!(key, "cache entry expired");
          }
        }
        Err(e) => warn!(key, tier = tier.name(), error = %e, "corrupt cache entry"),
      }

      if let Err(e) = self.evict_if_invalid(key, kind).await {
        warn!(key, error = %e, "failed to evict invalid cache entry");
      }
      return None;
    }

    debug!(key, "cache miss");
    None
  }

  /// Delete `key` from whichever tier holds it.
  pub async fn remove(&self, key: &str) -> StorageResult<()> {
    self
      .locks
      .run(key, || {
        self.fast.delete(key)?;
        self.bulk.delete(key)
      })
      .await
  }

  /// Re-check `key` under its lock and delete it if it is still invalid.
  ///
  /// Returns whether an entry was removed. A valid entry written after the
  /// caller's read is left alone.
  async fn evict_if_invalid(&self, key: &str, kind: TierKind) -> StorageResult<bool> {
    let tier = self.tier(kind);
    self
      .locks
      .run(key, || {
        let still_invalid = match tier.get(key)? {
          Some(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => !self.is_entry_valid(&entry),
            Err(_) => true,
          },
          None => false,
        };
        if still_invalid {
          tier.delete(key)?;
        }
        Ok(still_invalid)
      })
      .await
  }

  /// Evict every entry in both tiers that fails the validity policy.
  pub async fn sweep(&self) -> StorageResult<SweepReport> {
    let mut report = SweepReport::default();

    for kind in [TierKind::Fast, TierKind::Bulk] {
      let tier = self.tier(kind);
      for (key, bytes) in tier.get_all()? {
        report.scanned += 1;
        let valid = serde_json::from_slice::<CacheEntry>(&bytes)
          .map(|entry| self.is_entry_valid(&entry))
          .unwrap_or(false);
        if valid {
          continue;
        }
        match self.evict_if_invalid(&key, kind).await {
          Ok(true) => report.removed += 1,
          Ok(false) => {}
          Err(e) => {
            warn!(key, error = %e, "sweep failed to evict entry");
            report.failed += 1;
          }
        }
      }
    }

    debug!(?report, "cache sweep finished");
    Ok(report)
  }

  /// Remove every entry carrying `tag`, valid or not.
  pub async fn invalidate_tag(&self, tag: &str) -> StorageResult<usize> {
    let mut removed = 0;
    for kind in [TierKind::Fast, TierKind::Bulk] {
      for (key, bytes) in self.tier(kind).get_all()? {
        let tagged = serde_json::from_slice::<CacheEntry>(&bytes)
          .map(|entry| entry.tags.contains(tag))
          .unwrap_or(false);
        if tagged {
          self.remove(&key).await?;
          removed += 1;
        }
      }
    }
    Ok(removed)
  }

  /// Remove every key starting with `prefix`.
  pub async fn remove_prefix(&self, prefix: &str) -> StorageResult<usize> {
    let mut removed = 0;
    for kind in [TierKind::Fast, TierKind::Bulk] {
      for key in self.tier(kind).keys()? {
        if key.starts_with(prefix) {
          self.remove(&key).await?;
          removed += 1;
        }
      }
    }
    Ok(removed)
  }

  /// Keys currently stored in either tier, valid or not.
  pub fn keys(&self) -> StorageResult<Vec<String>> {
    let mut keys = self.fast.keys()?;
    keys.extend(self.bulk.keys()?);
    keys.sort();
    keys.dedup();
    Ok(keys)
  }

  pub fn tier_sizes(&self) -> StorageResult<TierSizes> {
    Ok(TierSizes {
      fast_bytes: self.fast.size_bytes()?,
      bulk_bytes: self.bulk.size_bytes()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::policy::Priority;
  use crate::cache::storage::{FileTier, MemoryTier};
  use crate::cache::traits::DEFAULT_TIER_THRESHOLD_BYTES;
  use crate::clock::ManualClock;
  use chrono::{Duration, Utc};

  struct Fixture {
    fast: Arc<MemoryTier>,
    bulk: Arc<MemoryTier>,
    clock: Arc<ManualClock>,
    cache: Arc<CacheLayer>,
  }

  fn fixture_with_version(version: &str) -> Fixture {
    let fast = Arc::new(MemoryTier::new("fast"));
    let bulk = Arc::new(MemoryTier::new("bulk"));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache = Arc::new(CacheLayer::new(
      fast.clone(),
      bulk.clone(),
      TtlPolicy::default(),
      version,
      DEFAULT_TIER_THRESHOLD_BYTES,
      clock.clone(),
    ));
    Fixture {
      fast,
      bulk,
      clock,
      cache,
    }
  }

  fn fixture() -> Fixture {
    fixture_with_version("1.0.0")
  }

  #[tokio::test]
  async fn test_read_your_write() {
    let f = fixture();
    f.cache
      .put("court:42", &vec!["a", "b"], CacheOptions::default())
      .await
      .unwrap();
    let value: Option<Vec<String>> = f.cache.get("court:42").await;
    assert_eq!(value, Some(vec!["a".to_string(), "b".to_string()]));
  }

  #[tokio::test]
  async fn test_high_priority_ttl_scenario() {
    let f = fixture();
    f.cache
      .put(
        "wilayas",
        &serde_json::json!([{"code": 16, "name": "Alger"}]),
        CacheOptions::with_priority(Priority::High),
      )
      .await
      .unwrap();

    f.clock.advance(Duration::milliseconds(3_000_000));
    assert!(f.cache.get::<serde_json::Value>("wilayas").await.is_some());

    f.clock.advance(Duration::milliseconds(700_000));
    assert!(f.cache.get::<serde_json::Value>("wilayas").await.is_none());
    // Lazy eviction removed the stale entry
    assert_eq!(f.fast.get("wilayas").unwrap(), None);
  }

  #[tokio::test]
  async fn test_large_entries_go_to_bulk_tier() {
    let f = fixture();
    let big = "x".repeat(DEFAULT_TIER_THRESHOLD_BYTES);
    f.cache.put("big", &big, CacheOptions::default()).await.unwrap();
    f.cache.put("small", &"tiny", CacheOptions::default()).await.unwrap();

    assert!(f.bulk.get("big").unwrap().is_some());
    assert!(f.fast.get("big").unwrap().is_none());
    assert!(f.fast.get("small").unwrap().is_some());
    assert!(f.bulk.get("small").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_rewrite_moves_entry_between_tiers() {
    let f = fixture();
    let big = "x".repeat(DEFAULT_TIER_THRESHOLD_BYTES);
    f.cache.put("doc", &big, CacheOptions::default()).await.unwrap();
    f.cache.put("doc", &"short", CacheOptions::default()).await.unwrap();

    assert!(f.bulk.get("doc").unwrap().is_none());
    assert_eq!(f.cache.get::<String>("doc").await, Some("short".to_string()));
  }

  #[tokio::test]
  async fn test_version_change_is_a_miss() {
    let old = fixture_with_version("0.9.0");
    old
      .cache
      .put("k", &1, CacheOptions::default())
      .await
      .unwrap();

    let new_cache = CacheLayer::new(
      old.fast.clone(),
      old.bulk.clone(),
      TtlPolicy::default(),
      "1.0.0",
      DEFAULT_TIER_THRESHOLD_BYTES,
      old.clock.clone(),
    );
    assert_eq!(new_cache.get::<i32>("k").await, None);
    assert!(old.fast.get("k").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_corrupt_entry_is_evicted_not_raised() {
    let f = fixture();
    f.fast.put("broken", b"{not json").unwrap();

    assert_eq!(f.cache.get::<serde_json::Value>("broken").await, None);
    assert!(f.fast.get("broken").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_remove_is_noop_when_absent() {
    let f = fixture();
    f.cache.remove("nothing").await.unwrap();
    f.cache.put("k", &1, CacheOptions::default()).await.unwrap();
    f.cache.remove("k").await.unwrap();
    assert_eq!(f.cache.get::<i32>("k").await, None);
  }

  #[tokio::test]
  async fn test_write_failure_is_returned() {
    let fast = Arc::new(MemoryTier::new("fast").with_quota(Some(64)));
    let cache = CacheLayer::new(
      fast,
      Arc::new(MemoryTier::new("bulk")),
      TtlPolicy::default(),
      "1.0.0",
      DEFAULT_TIER_THRESHOLD_BYTES,
      Arc::new(ManualClock::default()),
    );
    let err = cache
      .put("k", &"a value that will not fit", CacheOptions::default())
      .await
      .unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded { .. }));
  }

  #[tokio::test]
  async fn test_failed_tier_move_keeps_single_copy() {
    let f = fixture();
    let big = "x".repeat(DEFAULT_TIER_THRESHOLD_BYTES);
    f.cache.put("doc", &big, CacheOptions::default()).await.unwrap();

    f.bulk.set_fail_writes(true);
    assert!(f.cache.put("doc", &"short", CacheOptions::default()).await.is_err());
    assert!(f.fast.get("doc").unwrap().is_none());
    assert_eq!(f.cache.get::<String>("doc").await, Some(big));
  }

  fn file_backed(dir: &std::path::Path) -> CacheLayer {
    CacheLayer::new(
      Arc::new(MemoryTier::new("fast")),
      Arc::new(FileTier::open(dir).unwrap()),
      TtlPolicy::default(),
      "1.0.0",
      16,
      Arc::new(ManualClock::default()),
    )
  }

  fn entry_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
      .unwrap()
      .map(|e| e.unwrap().path())
      .filter(|p| p.extension().map_or(false, |e| e == "entry"))
      .collect()
  }

  #[tokio::test]
  async fn test_empty_bulk_file_is_evicted_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let cache = file_backed(dir.path());
    cache.put("doc", &"bulk payload", CacheOptions::default()).await.unwrap();
    let files = entry_files(dir.path());
    assert_eq!(files.len(), 1);
    std::fs::write(&files[0], b"").unwrap();

    assert_eq!(cache.get::<String>("doc").await, None);
    assert!(!files[0].exists());
  }

  #[tokio::test]
  async fn test_sweep_clears_unreadable_bulk_files() {
    let dir = tempfile::tempdir().unwrap();
    let cache = file_backed(dir.path());
    cache.put("a", &"first payload", CacheOptions::default()).await.unwrap();
    cache.put("b", &"second payload", CacheOptions::default()).await.unwrap();
    let files = entry_files(dir.path());
    assert_eq!(files.len(), 2);
    std::fs::write(&files[0], b"").unwrap();

    cache.sweep().await.unwrap();
    assert_eq!(entry_files(dir.path()).len(), 1);
    assert_eq!(cache.keys().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_sweep_removes_exactly_invalid_entries() {
    let f = fixture();
    let stale_version = CacheLayer::new(
      f.fast.clone(),
      f.bulk.clone(),
      TtlPolicy::default(),
      "0.1.0",
      DEFAULT_TIER_THRESHOLD_BYTES,
      f.clock.clone(),
    );
    let big = "y".repeat(DEFAULT_TIER_THRESHOLD_BYTES);

    f.cache.put("low-old", &1, CacheOptions::with_priority(Priority::Low)).await.unwrap();
    f.cache.put("big-low-old", &big, CacheOptions::with_priority(Priority::Low)).await.unwrap();
    f.cache.put("medium-old", &2, CacheOptions::with_priority(Priority::Medium)).await.unwrap();
    f.cache.put("high-old", &3, CacheOptions::with_priority(Priority::High)).await.unwrap();
    stale_version.put("outdated", &4, CacheOptions::with_priority(Priority::High)).await.unwrap();

    f.clock.advance(Duration::minutes(15));
    f.cache.put("low-new", &5, CacheOptions::with_priority(Priority::Low)).await.unwrap();
    f.fast.put("garbage", b"\x00\x01").unwrap();

    let report = f.cache.sweep().await.unwrap();
    assert_eq!(report.scanned, 7);
    assert_eq!(report.removed, 4);
    assert_eq!(report.failed, 0);

    let remaining = f.cache.keys().unwrap();
    assert_eq!(
      remaining,
      vec![
        "high-old".to_string(),
        "low-new".to_string(),
        "medium-old".to_string()
      ]
    );
  }

  #[tokio::test]
  async fn test_invalidate_tag() {
    let f = fixture();
    f.cache.put("a", &1, CacheOptions::default().tag("lookup")).await.unwrap();
    f.cache.put("b", &2, CacheOptions::default().tag("lookup")).await.unwrap();
    f.cache.put("c", &3, CacheOptions::default()).await.unwrap();

    assert_eq!(f.cache.invalidate_tag("lookup").await.unwrap(), 2);
    assert_eq!(f.cache.keys().unwrap(), vec!["c".to_string()]);
  }

  #[tokio::test]
  async fn test_concurrent_puts_on_same_key_leave_one_entry() {
    let f = fixture();
    let big = "z".repeat(DEFAULT_TIER_THRESHOLD_BYTES);

    for _ in 0..20 {
      let (a, b) = tokio::join!(
        f.cache.put("doc", &big, CacheOptions::with_priority(Priority::High)),
        f.cache.put("doc", &"small", CacheOptions::with_priority(Priority::Low)),
      );
      a.unwrap();
      b.unwrap();

      let in_fast = f.fast.get("doc").unwrap().is_some();
      let in_bulk = f.bulk.get("doc").unwrap().is_some();
      assert!(in_fast ^ in_bulk, "entry must live in exactly one tier");

      let entry = f.cache.get_entry("doc").await.unwrap();
      match entry.priority {
        Priority::High => assert_eq!(entry.data, serde_json::json!(big)),
        Priority::Low => assert_eq!(entry.data, serde_json::json!("small")),
        Priority::Medium => panic!("unexpected priority"),
      }
    }
  }

  #[tokio::test]
  async fn test_concurrent_puts_across_tasks() {
    let f = fixture();
    let mut handles = Vec::new();
    for i in 0..16 {
      let cache = f.cache.clone();
      handles.push(tokio::spawn(async move {
        let priority = if i % 2 == 0 { Priority::High } else { Priority::Low };
        cache
          .put("shared", &i, CacheOptions::with_priority(priority))
          .await
      }));
    }
    for result in futures::future::join_all(handles).await {
      result.unwrap().unwrap();
    }

    let entry = f.cache.get_entry("shared").await.unwrap();
    let i = entry.data.as_i64().unwrap();
    let expected = if i % 2 == 0 { Priority::High } else { Priority::Low };
    assert_eq!(entry.priority, expected);
    assert_eq!(f.cache.keys().unwrap(), vec!["shared".to_string()]);
  }
}
