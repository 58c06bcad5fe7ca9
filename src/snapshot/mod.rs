//! Whole-dataset export for offline use and the matching import path.

mod exporter;
mod manifest;

pub use exporter::{
  table_key, ExportSettings, ImportReport, ProgressStatus, SnapshotExporter, SyncProgress,
  SyncResult, SyncStatus, TableError, MANIFEST_KEY, SNAPSHOT_TAG, TABLE_KEY_PREFIX,
};
pub use manifest::{
  LocalDataExport, TableSnapshot, FLAG_CANCELLED, FLAG_COMPLETE, FLAG_OFFLINE_READY,
};
