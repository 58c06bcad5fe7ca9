//! Core traits and types for the tiered cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::policy::Priority;
use crate::error::StorageResult;

/// Default size at which an entry moves from the fast tier to the bulk tier.
pub const DEFAULT_TIER_THRESHOLD_BYTES: usize = 50 * 1024;

/// A single stored value plus the metadata the validity policy needs.
///
/// Entries are replaced wholesale on every write; they are never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub data: serde_json::Value,
  pub timestamp: DateTime<Utc>,
  pub version: String,
  pub priority: Priority,
  #[serde(default)]
  pub tags: BTreeSet<String>,
  /// Per-entry lifetime replacing the priority TTL, in milliseconds.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ttl_override_ms: Option<i64>,
}

/// Options accepted by `put`.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
  pub priority: Priority,
  pub tags: BTreeSet<String>,
  pub ttl_override: Option<Duration>,
}

impl CacheOptions {
  pub fn with_priority(priority: Priority) -> Self {
    Self {
      priority,
      ..Self::default()
    }
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn ttl_override(mut self, ttl: Duration) -> Self {
    self.ttl_override = Some(ttl);
    self
  }
}

/// Which backend holds an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
  Fast,
  Bulk,
}

/// Route an entry by its serialized size: strictly below the threshold goes
/// to the fast tier, everything else to the bulk tier.
pub fn select_tier(serialized_len: usize, threshold: usize) -> TierKind {
  if serialized_len < threshold {
    TierKind::Fast
  } else {
    TierKind::Bulk
  }
}

/// A durable key/value backend.
///
/// Implementations must make `put` atomic with respect to `get`: a reader
/// sees either the old bytes or the new bytes, never a mix.
pub trait StorageTier: Send + Sync {
  /// Short name used in logs and errors.
  fn name(&self) -> &'static str;

  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

  /// Remove a key. Missing keys are not an error.
  fn delete(&self, key: &str) -> StorageResult<()>;

  /// Every stored key and value.
  fn get_all(&self) -> StorageResult<Vec<(String, Vec<u8>)>>;

  /// Every stored key, without loading values.
  fn keys(&self) -> StorageResult<Vec<String>>;

  /// Total bytes of stored values.
  fn size_bytes(&self) -> StorageResult<u64>;
}
