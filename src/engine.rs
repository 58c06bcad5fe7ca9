//! `OfflineEngine`: the one object the rest of the portal talks to.
//!
//! It owns the cache, the sync queue and processor, the connectivity monitor
//! and the snapshot exporter, and wires them together once at construction.

use color_eyre::{eyre::WrapErr, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{
  CacheLayer, CacheOptions, FileTier, MemoryTier, SqliteDatabase, SqliteTier, StorageTier,
  SweepReport, TtlPolicy,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, ReachabilityProbe};
use crate::error::{QueuePersistError, SnapshotError, StorageResult};
use crate::remote::{HttpRemote, RemoteDataService};
use crate::snapshot::{
  ExportSettings, ImportReport, LocalDataExport, SnapshotExporter, SyncProgress, SyncResult,
  SyncStatus, TableSnapshot,
};
use crate::stats::{self, CacheStats};
use crate::sync::{
  DrainReport, FailedJob, SyncEvent, SyncJob, SyncJobInput, SyncProcessor, SyncQueue, SyncSettings,
};

const DATABASE_FILE: &str = "lexsync.db";
const BULK_DIR: &str = "bulk";
const CACHE_NAMESPACE: &str = "cache";
const SYNC_NAMESPACE: &str = "sync";

/// Everything the engine is assembled from.
pub struct EngineParts {
  pub fast: Arc<dyn StorageTier>,
  pub bulk: Arc<dyn StorageTier>,
  /// Durable home of the sync queue and dead-letter list
  pub sync_store: Arc<dyn StorageTier>,
  pub remote: Arc<dyn RemoteDataService>,
  pub probe: Option<Arc<dyn ReachabilityProbe>>,
  pub clock: Arc<dyn Clock>,
  pub policy: TtlPolicy,
  pub engine_version: String,
  pub tier_threshold: usize,
  pub sync: SyncSettings,
  pub export: ExportSettings,
  pub probe_interval: Duration,
  pub initially_online: bool,
}

pub struct OfflineEngine {
  cache: Arc<CacheLayer>,
  queue: Arc<SyncQueue>,
  connectivity: Arc<ConnectivityMonitor>,
  processor: Arc<SyncProcessor>,
  exporter: Arc<SnapshotExporter>,
  probe: Option<Arc<dyn ReachabilityProbe>>,
  probe_interval: Duration,
}

impl OfflineEngine {
  pub fn from_parts(parts: EngineParts) -> StorageResult<Self> {
    let cache = Arc::new(CacheLayer::new(
      parts.fast,
      parts.bulk,
      parts.policy,
      parts.engine_version,
      parts.tier_threshold,
      parts.clock.clone(),
    ));
    let queue = Arc::new(SyncQueue::load(parts.sync_store)?);
    let connectivity = Arc::new(ConnectivityMonitor::new(
      parts.initially_online,
      parts.clock.clone(),
    ));
    let processor = SyncProcessor::new(
      queue.clone(),
      parts.remote.clone(),
      connectivity.clone(),
      parts.sync,
      parts.clock.clone(),
    );
    let exporter = Arc::new(SnapshotExporter::new(
      parts.remote,
      cache.clone(),
      parts.export,
      parts.clock,
    ));

    Ok(Self {
      cache,
      queue,
      connectivity,
      processor,
      exporter,
      probe: parts.probe,
      probe_interval: parts.probe_interval,
    })
  }

  /// Open the persistent engine described by `config`.
  ///
  /// The engine starts offline; call `check_connectivity` or `start_probe`
  /// to learn the real state.
  pub fn open(config: &Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
      .wrap_err_with(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let db = SqliteDatabase::open(&data_dir.join(DATABASE_FILE))
      .wrap_err("Failed to open local database")?;
    let fast = SqliteTier::new(db.clone(), CACHE_NAMESPACE)
      .with_quota(config.fast_tier_quota_bytes());
    let sync_store = SqliteTier::new(db, SYNC_NAMESPACE);
    let bulk = FileTier::open(data_dir.join(BULK_DIR)).wrap_err("Failed to open bulk tier")?;

    let engine = Self::with_stores(config, Arc::new(fast), Arc::new(bulk), Arc::new(sync_store))?;
    info!(data_dir = %data_dir.display(), "offline engine opened");
    Ok(engine)
  }

  /// Engine backed by memory only. Nothing survives the process.
  pub fn open_ephemeral(config: &Config) -> Result<Self> {
    let fast = MemoryTier::new("memory-fast").with_quota(config.fast_tier_quota_bytes());
    Self::with_stores(
      config,
      Arc::new(fast),
      Arc::new(MemoryTier::new("memory-bulk")),
      Arc::new(MemoryTier::new("memory-sync")),
    )
  }

  fn with_stores(
    config: &Config,
    fast: Arc<dyn StorageTier>,
    bulk: Arc<dyn StorageTier>,
    sync_store: Arc<dyn StorageTier>,
  ) -> Result<Self> {
    let remote = Arc::new(
      HttpRemote::new(&config.remote, Config::api_key()).wrap_err("Failed to build remote client")?,
    );
    let parts = EngineParts {
      fast,
      bulk,
      sync_store,
      remote: remote.clone(),
      probe: Some(remote),
      clock: Arc::new(SystemClock),
      policy: config.ttl_policy()?,
      engine_version: config.cache.engine_version.clone(),
      tier_threshold: config.cache.tier_threshold_bytes,
      sync: config.sync_settings(),
      export: config.export_settings(),
      probe_interval: config.probe_interval(),
      initially_online: false,
    };
    Self::from_parts(parts).wrap_err("Failed to load sync queue")
  }

  pub async fn cache_data<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    options: CacheOptions,
  ) -> StorageResult<()> {
    self.cache.put(key, value, options).await
  }

  pub async fn get_cached_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.cache.get(key).await
  }

  pub async fn remove_from_cache(&self, key: &str) -> StorageResult<()> {
    self.cache.remove(key).await
  }

  /// Evict every invalid entry.
  pub async fn cleanup_cache(&self) -> StorageResult<SweepReport> {
    self.cache.sweep().await
  }

  pub async fn invalidate_tag(&self, tag: &str) -> StorageResult<usize> {
    self.cache.invalidate_tag(tag).await
  }

  pub fn get_cache_stats(&self) -> StorageResult<CacheStats> {
    stats::collect(&self.cache, &self.queue, &self.connectivity)
  }

  /// Queue a mutation for the remote side. Returns the job id.
  pub fn add_to_sync_queue(&self, input: SyncJobInput) -> Result<String, QueuePersistError> {
    self.processor.enqueue(input)
  }

  /// Drain the queue now. `None` when a drain is already running.
  pub async fn drain_sync_queue(&self) -> Option<DrainReport> {
    self.processor.drain().await
  }

  pub fn pending_jobs(&self) -> Vec<SyncJob> {
    self.queue.pending()
  }

  /// Jobs dropped after exhausting their retries.
  pub fn failed_jobs(&self) -> Vec<FailedJob> {
    self.queue.failed_jobs()
  }

  pub fn clear_failed_jobs(&self) -> StorageResult<()> {
    self.queue.clear_failed()
  }

  pub fn clear_sync_queue(&self) -> StorageResult<()> {
    self.queue.clear()
  }

  /// Pull the full remote dataset for offline use.
  pub async fn sync_all_data(&self) -> SyncResult {
    self.exporter.export_all().await
  }

  pub fn cancel_sync(&self) {
    self.exporter.cancel();
  }

  pub fn get_progress(&self) -> SyncProgress {
    self.exporter.progress()
  }

  pub fn on_progress(&self, callback: impl Fn(&SyncProgress) + Send + Sync + 'static) {
    self.exporter.on_progress(callback);
  }

  pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
    self.exporter.subscribe_progress()
  }

  pub async fn check_sync_status(&self) -> SyncStatus {
    self.exporter.check_sync_status().await
  }

  pub async fn clear_local_data(&self) -> StorageResult<usize> {
    self.exporter.clear_local_data().await
  }

  /// Offline copy of one exported table.
  pub async fn get_table(&self, name: &str) -> Option<TableSnapshot> {
    self.exporter.table(name).await
  }

  pub async fn last_manifest(&self) -> Option<LocalDataExport> {
    self.exporter.manifest().await
  }

  pub async fn import_manifest(&self, manifest: LocalDataExport) -> StorageResult<ImportReport> {
    self.exporter.import_manifest(manifest).await
  }

  pub async fn import_file(&self, path: &Path) -> Result<ImportReport, SnapshotError> {
    self.exporter.import_file(path).await
  }

  pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.processor.subscribe()
  }

  pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.connectivity.subscribe()
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Feed a platform online/offline notification.
  pub fn set_online(&self, online: bool) -> bool {
    self.connectivity.set_online(online)
  }

  /// Ask the probe once and update the monitor. Returns the new state.
  pub async fn check_connectivity(&self) -> bool {
    if let Some(probe) = &self.probe {
      let reachable = probe.is_reachable().await;
      self.connectivity.set_online(reachable);
    }
    self.connectivity.is_online()
  }

  /// Keep polling the probe in the background. `None` without a probe.
  pub fn start_probe(&self) -> Option<JoinHandle<()>> {
    let probe = self.probe.clone()?;
    Some(self.connectivity.spawn_probe(probe, self.probe_interval))
  }
}
