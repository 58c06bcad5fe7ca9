//! Cache validity policy: decides whether a stored entry may still be served.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::traits::CacheEntry;

/// Declared importance of a cached entry. Higher priority lives longer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  #[default]
  Medium,
  Low,
}

/// Time-to-live per priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
  pub high: Duration,
  pub medium: Duration,
  pub low: Duration,
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self {
      high: Duration::hours(1),
      medium: Duration::minutes(30),
      low: Duration::minutes(10),
    }
  }
}

impl TtlPolicy {
  /// Build a policy, rejecting orderings where a lower priority outlives a higher one.
  pub fn new(high: Duration, medium: Duration, low: Duration) -> Result<Self, String> {
    if !(high > medium && medium > low) {
      return Err(format!(
        "ttl must satisfy high > medium > low (got {}s / {}s / {}s)",
        high.num_seconds(),
        medium.num_seconds(),
        low.num_seconds()
      ));
    }
    Ok(Self { high, medium, low })
  }

  pub fn ttl(&self, priority: Priority) -> Duration {
    match priority {
      Priority::High => self.high,
      Priority::Medium => self.medium,
      Priority::Low => self.low,
    }
  }

  /// Effective lifetime of an entry, honouring a per-entry override.
  pub fn ttl_for(&self, entry: &CacheEntry) -> Duration {
    entry
      .ttl_override_ms
      .map(Duration::milliseconds)
      .unwrap_or_else(|| self.ttl(entry.priority))
  }
}

/// An entry is valid iff it was written by the current engine version and
/// has not outlived its TTL.
pub fn is_valid(
  entry: &CacheEntry,
  current_version: &str,
  now: DateTime<Utc>,
  policy: &TtlPolicy,
) -> bool {
  entry.version == current_version && now - entry.timestamp <= policy.ttl_for(entry)
}
