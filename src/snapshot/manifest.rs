//! Portable export manifest.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::SnapshotError;

/// Metadata flag: every table exported without error.
pub const FLAG_COMPLETE: &str = "complete";
/// Metadata flag: the export was cancelled before the last table.
pub const FLAG_CANCELLED: &str = "cancelled";
/// Metadata flag: at least one table is available offline.
pub const FLAG_OFFLINE_READY: &str = "offlineReady";

/// One table's records as pulled from the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
  pub name: String,
  pub record_count: u64,
  #[serde(rename = "size")]
  pub byte_size: u64,
  #[serde(rename = "data")]
  pub records: Vec<serde_json::Value>,
}

impl TableSnapshot {
  /// Build a snapshot, deriving the count and byte size from `records`.
  pub fn new(name: impl Into<String>, records: Vec<serde_json::Value>) -> Self {
    let byte_size = serde_json::to_vec(&records)
      .map(|bytes| bytes.len() as u64)
      .unwrap_or(0);
    Self {
      name: name.into(),
      record_count: records.len() as u64,
      byte_size,
      records,
    }
  }

  /// Declared record count matches the records actually carried.
  pub fn is_consistent(&self) -> bool {
    self.record_count == self.records.len() as u64
  }
}

/// The downloadable export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDataExport {
  /// ISO-8601 creation time, kept as text so files round-trip byte for byte
  pub timestamp: String,
  pub version: String,
  pub tables: Vec<TableSnapshot>,
  #[serde(default)]
  pub metadata: BTreeMap<String, bool>,
}

impl LocalDataExport {
  pub fn new(
    created_at: DateTime<Utc>,
    version: impl Into<String>,
    tables: Vec<TableSnapshot>,
    metadata: BTreeMap<String, bool>,
  ) -> Self {
    Self {
      timestamp: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
      version: version.into(),
      tables,
      metadata,
    }
  }

  pub fn created_at(&self) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&self.timestamp)
      .ok()
      .map(|dt| dt.with_timezone(&Utc))
  }

  pub fn flag(&self, name: &str) -> bool {
    self.metadata.get(name).copied().unwrap_or(false)
  }

  pub fn total_records(&self) -> u64 {
    self.tables.iter().map(|t| t.record_count).sum()
  }

  pub fn from_slice(bytes: &[u8]) -> Result<Self, SnapshotError> {
    Ok(serde_json::from_slice(bytes)?)
  }

  pub fn read_from(path: &Path) -> Result<Self, SnapshotError> {
    let bytes = std::fs::read(path).map_err(|source| SnapshotError::Read {
      path: path.display().to_string(),
      source,
    })?;
    Self::from_slice(&bytes)
  }

  pub fn write_to(&self, path: &Path) -> Result<(), SnapshotError> {
    let bytes = serde_json::to_vec_pretty(self)?;
    let write_err = |source| SnapshotError::Write {
      path: path.display().to_string(),
      source,
    };
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, bytes).map_err(write_err)
  }

  /// File name used when offering the manifest as a download.
  pub fn file_name(&self) -> String {
    let stamp: String = self
      .timestamp
      .chars()
      .map(|c| if c == ':' || c == '.' { '-' } else { c })
      .collect();
    format!("lexsync-export-{}.json", stamp)
  }
}
