//! Tiered key/value cache for offline operation.
//!
//! This module provides:
//! - A validity policy combining engine version and per-priority TTLs
//! - Size-based routing between a fast small-object tier and a bulk tier
//! - Lazy eviction on read plus explicit sweeps
//! - Per-key write serialization

mod layer;
mod policy;
mod storage;
mod traits;

pub use layer::{CacheLayer, SweepReport, TierSizes};
pub use policy::{is_valid, Priority, TtlPolicy};
pub use storage::{FileTier, MemoryTier, SqliteDatabase, SqliteTier};
pub use traits::{
  select_tier, CacheEntry, CacheOptions, StorageTier, TierKind, DEFAULT_TIER_THRESHOLD_BYTES,
};
