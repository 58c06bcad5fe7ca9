//! Bulk exporter/importer: pulls every remote table into the cache so the
//! portal can run fully offline, and produces the portable manifest.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{info, warn};

use super::manifest::{
  LocalDataExport, TableSnapshot, FLAG_CANCELLED, FLAG_COMPLETE, FLAG_OFFLINE_READY,
};
use crate::cache::{CacheLayer, CacheOptions, Priority};
use crate::clock::Clock;
use crate::error::{RemoteError, RemoteResult, SnapshotError, StorageResult};
use crate::remote::RemoteDataService;

/// Cache key prefix for table snapshots.
pub const TABLE_KEY_PREFIX: &str = "table:";
/// Cache key of the last manifest.
pub const MANIFEST_KEY: &str = "sync:manifest";
/// Tag carried by every entry the exporter writes.
pub const SNAPSHOT_TAG: &str = "snapshot";

pub fn table_key(name: &str) -> String {
  format!("{}{}", TABLE_KEY_PREFIX, name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
  #[default]
  Idle,
  Syncing,
  Completed,
  Cancelled,
  Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
  pub current: usize,
  pub total: usize,
  pub percentage: u8,
  pub current_table: Option<String>,
  pub status: ProgressStatus,
}

impl SyncProgress {
  fn at(current: usize, total: usize, table: Option<&str>, status: ProgressStatus) -> Self {
    let percentage = if total == 0 {
      100
    } else {
      (current * 100 / total) as u8
    };
    Self {
      current,
      total,
      percentage,
      current_table: table.map(String::from),
      status,
    }
  }
}

/// A table that could not be exported or imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableError {
  pub table: String,
  pub message: String,
}

impl TableError {
  fn new(table: &str, message: impl ToString) -> Self {
    Self {
      table: table.to_string(),
      message: message.to_string(),
    }
  }
}

/// Outcome of `export_all`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
  /// True only when no table failed and the export ran to the end
  pub success: bool,
  pub tables_synced: Vec<String>,
  pub total_records: u64,
  pub total_size: u64,
  pub duration_ms: u64,
  pub errors: Vec<TableError>,
  pub cancelled: bool,
  /// Where the downloadable manifest was written, if anywhere
  pub manifest_path: Option<PathBuf>,
}

/// Summary of the last stored manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub last_sync: Option<DateTime<Utc>>,
  pub tables_count: usize,
  pub total_records: u64,
  pub is_complete: bool,
}

/// Outcome of importing a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
  pub tables_imported: Vec<String>,
  pub total_records: u64,
  pub errors: Vec<TableError>,
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
  /// Export only these tables instead of asking the remote
  pub tables: Option<Vec<String>>,
  /// Lifetime of exported snapshots in the cache
  pub snapshot_ttl: chrono::Duration,
  /// Upper bound on a single remote call
  pub call_timeout: Duration,
  /// Directory receiving the downloadable manifest
  pub output_dir: Option<PathBuf>,
}

impl Default for ExportSettings {
  fn default() -> Self {
    Self {
      tables: None,
      snapshot_ttl: chrono::Duration::days(30),
      call_timeout: Duration::from_secs(30),
      output_dir: None,
    }
  }
}

type ProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

pub struct SnapshotExporter {
  remote: Arc<dyn RemoteDataService>,
  cache: Arc<CacheLayer>,
  settings: ExportSettings,
  clock: Arc<dyn Clock>,
  progress: watch::Sender<SyncProgress>,
  callbacks: Mutex<Vec<ProgressCallback>>,
  cancel_requested: AtomicBool,
  running: AsyncMutex<()>,
}

impl SnapshotExporter {
  pub fn new(
    remote: Arc<dyn RemoteDataService>,
    cache: Arc<CacheLayer>,
    settings: ExportSettings,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (progress, _) = watch::channel(SyncProgress::default());
    Self {
      remote,
      cache,
      settings,
      clock,
      progress,
      callbacks: Mutex::new(Vec::new()),
      cancel_requested: AtomicBool::new(false),
      running: AsyncMutex::new(()),
    }
  }

  /// Latest progress report.
  pub fn progress(&self) -> SyncProgress {
    self.progress.borrow().clone()
  }

  pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
    self.progress.subscribe()
  }

  /// Register a callback invoked on every progress update.
  pub fn on_progress(&self, callback: impl Fn(&SyncProgress) + Send + Sync + 'static) {
    self
      .callbacks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(Arc::new(callback));
  }

  /// Ask a running export to stop before its next table.
  pub fn cancel(&self) {
    self.cancel_requested.store(true, Ordering::SeqCst);
  }

  fn publish(&self, progress: SyncProgress) {
    // Callbacks run outside the lock so they may register more callbacks
    let callbacks = self
      .callbacks
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    for callback in &callbacks {
      callback(&progress);
    }
    self.progress.send_replace(progress);
  }

  async fn with_timeout<T>(
    &self,
    call: impl std::future::Future<Output = RemoteResult<T>>,
  ) -> RemoteResult<T> {
    let timeout = self.settings.call_timeout;
    tokio::time::timeout(timeout, call)
      .await
      .map_err(|_| RemoteError::Timeout(timeout))?
  }

  fn snapshot_options(&self) -> CacheOptions {
    CacheOptions::with_priority(Priority::High)
      .tag(SNAPSHOT_TAG)
      .ttl_override(self.settings.snapshot_ttl)
  }

  async fn table_names(&self) -> RemoteResult<Vec<String>> {
    if let Some(tables) = &self.settings.tables {
      return Ok(tables.clone());
    }
    let tables = self.with_timeout(self.remote.list_tables()).await?;
    Ok(tables.into_iter().map(|t| t.name).collect())
  }

  /// Pull every table into the cache and write a fresh manifest.
  ///
  /// A failing table is recorded and skipped; it never aborts the export.
  pub async fn export_all(&self) -> SyncResult {
    let _running = self.running.lock().await;
    self.cancel_requested.store(false, Ordering::SeqCst);
    let started = Instant::now();
    let mut result = SyncResult::default();

    let tables = match self.table_names().await {
      Ok(tables) => tables,
      Err(e) => {
        warn!(error = %e, "could not list remote tables");
        result.errors.push(TableError::new("*", e));
        result.duration_ms = started.elapsed().as_millis() as u64;
        self.publish(SyncProgress::at(0, 0, None, ProgressStatus::Error));
        return result;
      }
    };
    let total = tables.len();
    let mut processed = 0;
    info!(tables = total, "export started");

    for (index, table) in tables.iter().enumerate() {
      if self.cancel_requested.load(Ordering::SeqCst) {
        info!(completed = index, "export cancelled");
        result.cancelled = true;
        break;
      }
      self.publish(SyncProgress::at(index, total, Some(table), ProgressStatus::Syncing));

      match self.export_table(table).await {
        Ok(snapshot) => {
          info!(table = %table, records = snapshot.record_count, bytes = snapshot.byte_size, "table exported");
          result.tables_synced.push(table.clone());
          result.total_records += snapshot.record_count;
          result.total_size += snapshot.byte_size;
        }
        Err(e) => {
          warn!(table = %table, error = %e, "table export failed");
          result.errors.push(TableError::new(table, e));
        }
      }
      processed = index + 1;

      self.publish(SyncProgress::at(index + 1, total, Some(table), ProgressStatus::Syncing));
    }

    match self.write_manifest(&mut result).await {
      Ok(path) => result.manifest_path = path,
      Err(e) => {
        warn!(error = %e, "failed to write export manifest");
        result.errors.push(TableError::new("manifest", e));
      }
    }

    result.success = result.errors.is_empty() && !result.cancelled;
    result.duration_ms = started.elapsed().as_millis() as u64;

    let status = if result.cancelled {
      ProgressStatus::Cancelled
    } else if result.success {
      ProgressStatus::Completed
    } else {
      ProgressStatus::Error
    };
    self.publish(SyncProgress::at(processed, total, None, status));

    info!(
      synced = result.tables_synced.len(),
      failed = result.errors.len(),
      records = result.total_records,
      bytes = result.total_size,
      duration_ms = result.duration_ms,
      "export finished"
    );
    result
  }

  async fn export_table(&self, table: &str) -> Result<TableSnapshot, SnapshotError> {
    let records = self.with_timeout(self.remote.fetch_all(table)).await?;
    let snapshot = TableSnapshot::new(table, records);
    self
      .cache
      .put(&table_key(table), &snapshot, self.snapshot_options())
      .await?;
    Ok(snapshot)
  }

  /// Build the manifest from the snapshots just cached, store it and, when
  /// an output directory is configured, write the downloadable copy.
  async fn write_manifest(&self, result: &mut SyncResult) -> Result<Option<PathBuf>, SnapshotError> {
    let mut tables = Vec::with_capacity(result.tables_synced.len());
    let mut missing = Vec::new();
    for name in &result.tables_synced {
      match self.cache.get::<TableSnapshot>(&table_key(name)).await {
        Some(snapshot) => tables.push(snapshot),
        None => missing.push(name.clone()),
      }
    }
    for name in missing {
      result.tables_synced.retain(|t| *t != name);
      result
        .errors
        .push(TableError::new(&name, "snapshot unreadable after write"));
    }

    let metadata = BTreeMap::from([
      (
        FLAG_COMPLETE.to_string(),
        result.errors.is_empty() && !result.cancelled,
      ),
      (FLAG_CANCELLED.to_string(), result.cancelled),
      (FLAG_OFFLINE_READY.to_string(), !tables.is_empty()),
    ]);
    let manifest = LocalDataExport::new(
      self.clock.now(),
      self.cache.engine_version(),
      tables,
      metadata,
    );
    self
      .cache
      .put(MANIFEST_KEY, &manifest, self.snapshot_options())
      .await?;

    match &self.settings.output_dir {
      Some(dir) => {
        let path = dir.join(manifest.file_name());
        manifest.write_to(&path)?;
        info!(path = %path.display(), "export manifest written");
        Ok(Some(path))
      }
      None => Ok(None),
    }
  }

  /// Summarize the last stored manifest without touching the network.
  pub async fn check_sync_status(&self) -> SyncStatus {
    match self.cache.get::<LocalDataExport>(MANIFEST_KEY).await {
      Some(manifest) => SyncStatus {
        last_sync: manifest.created_at(),
        tables_count: manifest.tables.len(),
        total_records: manifest.total_records(),
        is_complete: manifest.flag(FLAG_COMPLETE),
      },
      None => SyncStatus::default(),
    }
  }

  /// The last stored manifest, if still valid.
  pub async fn manifest(&self) -> Option<LocalDataExport> {
    self.cache.get(MANIFEST_KEY).await
  }

  /// Offline copy of one table.
  pub async fn table(&self, name: &str) -> Option<TableSnapshot> {
    self.cache.get(&table_key(name)).await
  }

  /// Load a manifest into the cache. Tables whose declared record count
  /// disagrees with their data are reported and skipped.
  pub async fn import_manifest(&self, manifest: LocalDataExport) -> StorageResult<ImportReport> {
    let _running = self.running.lock().await;
    let mut report = ImportReport::default();
    let mut accepted = Vec::with_capacity(manifest.tables.len());

    for snapshot in manifest.tables {
      if !snapshot.is_consistent() {
        warn!(
          table = %snapshot.name,
          declared = snapshot.record_count,
          actual = snapshot.records.len(),
          "rejecting inconsistent table snapshot"
        );
        report.errors.push(TableError::new(
          &snapshot.name,
          format!(
            "recordCount {} does not match {} records",
            snapshot.record_count,
            snapshot.records.len()
          ),
        ));
        continue;
      }

      match self
        .cache
        .put(&table_key(&snapshot.name), &snapshot, self.snapshot_options())
        .await
      {
        Ok(()) => {
          report.tables_imported.push(snapshot.name.clone());
          report.total_records += snapshot.record_count;
          accepted.push(snapshot);
        }
        Err(e) => report.errors.push(TableError::new(&snapshot.name, e)),
      }
    }

    let mut metadata = manifest.metadata;
    if !report.errors.is_empty() {
      metadata.insert(FLAG_COMPLETE.to_string(), false);
    }
    let stored = LocalDataExport {
      timestamp: manifest.timestamp,
      version: manifest.version,
      tables: accepted,
      metadata,
    };
    self
      .cache
      .put(MANIFEST_KEY, &stored, self.snapshot_options())
      .await?;

    info!(
      imported = report.tables_imported.len(),
      rejected = report.errors.len(),
      "manifest imported"
    );
    Ok(report)
  }

  pub async fn import_file(&self, path: &Path) -> Result<ImportReport, SnapshotError> {
    let manifest = LocalDataExport::read_from(path)?;
    Ok(self.import_manifest(manifest).await?)
  }

  /// Remove every cached table snapshot and the manifest.
  ///
  /// The sync queue is a separate store and is left untouched.
  pub async fn clear_local_data(&self) -> StorageResult<usize> {
    let _running = self.running.lock().await;
    let mut removed = self.cache.remove_prefix(TABLE_KEY_PREFIX).await?;
    if self.cache.keys()?.iter().any(|k| k == MANIFEST_KEY) {
      self.cache.remove(MANIFEST_KEY).await?;
      removed += 1;
    }
    self.publish(SyncProgress::default());
    info!(removed, "local snapshot data cleared");
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryTier, TtlPolicy, DEFAULT_TIER_THRESHOLD_BYTES};
  use crate::clock::ManualClock;
  use crate::remote::mock::MockRemote;
  use serde_json::json;

  fn records(n: usize) -> Vec<serde_json::Value> {
    (0..n).map(|i| json!({ "id": i, "title": format!("record {}", i) })).collect()
  }

  fn five_tables() -> MockRemote {
    MockRemote::new()
      .with_table("t1_wilayas", records(58))
      .with_table("t2_courts", records(12))
      .with_table("t3_laws", records(40))
      .with_table("t4_decrees", records(7))
      .with_table("t5_rulings", records(3))
  }

  fn cache() -> Arc<CacheLayer> {
    Arc::new(CacheLayer::new(
      Arc::new(MemoryTier::new("fast")),
      Arc::new(MemoryTier::new("bulk")),
      TtlPolicy::default(),
      "1.0.0",
      DEFAULT_TIER_THRESHOLD_BYTES,
      Arc::new(ManualClock::default()),
    ))
  }

  fn exporter(remote: Arc<MockRemote>, cache: Arc<CacheLayer>, settings: ExportSettings) -> SnapshotExporter {
    SnapshotExporter::new(remote, cache, settings, Arc::new(ManualClock::default()))
  }

  #[tokio::test]
  async fn test_failing_table_does_not_abort_export() {
    let remote = Arc::new(five_tables());
    remote.fail_table("t3_laws");
    let exporter = exporter(remote, cache(), ExportSettings::default());

    let result = exporter.export_all().await;

    assert!(!result.success);
    assert_eq!(result.tables_synced.len(), 4);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].table, "t3_laws");
    assert_eq!(result.total_records, 58 + 12 + 7 + 3);
    assert!(exporter.table("t3_laws").await.is_none());
    assert_eq!(exporter.table("t4_decrees").await.unwrap().record_count, 7);

    let status = exporter.check_sync_status().await;
    assert_eq!(status.tables_count, 4);
    assert_eq!(status.total_records, 80);
    assert!(!status.is_complete);
  }

  #[tokio::test]
  async fn test_export_reports_progress_per_table() {
    let exporter = exporter(Arc::new(five_tables()), cache(), ExportSettings::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    exporter.on_progress(move |p| sink.lock().unwrap().push(p.clone()));

    let result = exporter.export_all().await;
    assert!(result.success);

    let seen = seen.lock().unwrap();
    let mut after_table: Vec<_> = seen
      .iter()
      .filter(|p| p.status == ProgressStatus::Syncing && p.current > 0)
      .map(|p| (p.current, p.percentage))
      .collect();
    after_table.dedup();
    assert_eq!(after_table, vec![(1, 20), (2, 40), (3, 60), (4, 80), (5, 100)]);

    let last = exporter.progress();
    assert_eq!(last.status, ProgressStatus::Completed);
    assert_eq!(last.percentage, 100);
  }

  #[tokio::test]
  async fn test_manifest_matches_cached_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ExportSettings {
      output_dir: Some(dir.path().to_path_buf()),
      ..ExportSettings::default()
    };
    let exporter = exporter(Arc::new(five_tables()), cache(), settings);

    let result = exporter.export_all().await;
    let path = result.manifest_path.unwrap();
    let file = LocalDataExport::read_from(&path).unwrap();

    assert_eq!(file, exporter.manifest().await.unwrap());
    assert_eq!(file.tables.len(), 5);
    assert!(file.tables.iter().all(TableSnapshot::is_consistent));
    assert!(file.flag(FLAG_COMPLETE));
    assert!(file.flag(FLAG_OFFLINE_READY));
    assert_eq!(file.version, "1.0.0");
  }

  #[tokio::test]
  async fn test_export_then_import_keeps_record_counts() {
    let source = exporter(Arc::new(five_tables()), cache(), ExportSettings::default());
    source.export_all().await;
    let manifest = source.manifest().await.unwrap();

    let target = exporter(Arc::new(MockRemote::new()), cache(), ExportSettings::default());
    let report = target.import_manifest(manifest.clone()).await.unwrap();
    assert!(report.errors.is_empty());

    for table in &manifest.tables {
      let imported = target.table(&table.name).await.unwrap();
      assert_eq!(imported.record_count, table.record_count);
    }
    assert_eq!(target.check_sync_status().await.total_records, manifest.total_records());
  }

  #[tokio::test]
  async fn test_import_rejects_inconsistent_tables() {
    let exporter = exporter(Arc::new(MockRemote::new()), cache(), ExportSettings::default());
    let mut bad = TableSnapshot::new("laws", records(3));
    bad.record_count = 10;
    let manifest = LocalDataExport::new(
      Utc::now(),
      "1.0.0",
      vec![TableSnapshot::new("courts", records(2)), bad],
      BTreeMap::from([(FLAG_COMPLETE.to_string(), true)]),
    );

    let report = exporter.import_manifest(manifest).await.unwrap();
    assert_eq!(report.tables_imported, vec!["courts".to_string()]);
    assert_eq!(report.errors.len(), 1);
    assert!(exporter.table("laws").await.is_none());
    assert!(!exporter.check_sync_status().await.is_complete);
  }

  #[tokio::test]
  async fn test_cancel_between_tables_keeps_completed_work() {
    let remote = Arc::new(five_tables());
    let exporter = Arc::new(exporter(remote, cache(), ExportSettings::default()));
    let handle = exporter.clone();
    exporter.on_progress(move |p| {
      if p.current == 2 && p.status == ProgressStatus::Syncing {
        handle.cancel();
      }
    });

    let result = exporter.export_all().await;
    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.tables_synced, vec!["t1_wilayas".to_string(), "t2_courts".to_string()]);
    assert_eq!(exporter.progress().status, ProgressStatus::Cancelled);
    assert!(exporter.manifest().await.unwrap().flag(FLAG_CANCELLED));
  }

  #[tokio::test]
  async fn test_callback_may_register_another_callback() {
    let exporter = Arc::new(exporter(Arc::new(five_tables()), cache(), ExportSettings::default()));
    let late_calls = Arc::new(Mutex::new(0usize));
    let handle = exporter.clone();
    let counter = late_calls.clone();
    exporter.on_progress(move |p| {
      if p.current == 1 && p.status == ProgressStatus::Syncing {
        let counter = counter.clone();
        handle.on_progress(move |_| *counter.lock().unwrap() += 1);
      }
    });

    let result = exporter.export_all().await;
    assert!(result.success);
    assert!(*late_calls.lock().unwrap() > 0);
  }

  #[tokio::test]
  async fn test_table_allow_list_overrides_remote() {
    let settings = ExportSettings {
      tables: Some(vec!["t2_courts".to_string()]),
      ..ExportSettings::default()
    };
    let exporter = exporter(Arc::new(five_tables()), cache(), settings);
    let result = exporter.export_all().await;
    assert_eq!(result.tables_synced, vec!["t2_courts".to_string()]);
    assert_eq!(result.total_records, 12);
  }

  #[tokio::test]
  async fn test_clear_local_data() {
    let cache = cache();
    cache.put("unrelated", &1, CacheOptions::default()).await.unwrap();
    let exporter = exporter(Arc::new(five_tables()), cache.clone(), ExportSettings::default());
    exporter.export_all().await;

    let removed = exporter.clear_local_data().await.unwrap();
    assert_eq!(removed, 6);
    assert_eq!(exporter.check_sync_status().await, SyncStatus::default());
    assert_eq!(cache.keys().unwrap(), vec!["unrelated".to_string()]);
  }
}
