//! Durable FIFO of pending sync jobs plus the list of jobs that were
//! permanently dropped.
//!
//! Both are stored as single JSON blobs and rewritten on every change, so a
//! restart reloads exactly what was pending, in the same order.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::job::{FailedJob, SyncJob};
use crate::cache::StorageTier;
use crate::error::{StorageError, StorageResult};

const QUEUE_KEY: &str = "sync_queue";
const FAILED_KEY: &str = "sync_failed";

pub struct SyncQueue {
  store: Arc<dyn StorageTier>,
  jobs: Mutex<VecDeque<SyncJob>>,
  failed: Mutex<Vec<FailedJob>>,
}

fn load_blob<T: DeserializeOwned + Default>(
  store: &dyn StorageTier,
  key: &str,
) -> StorageResult<T> {
  match store.get(key)? {
    Some(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
      key: key.to_string(),
      source,
    }),
    None => Ok(T::default()),
  }
}

fn save_blob<T: Serialize + ?Sized>(store: &dyn StorageTier, key: &str, value: &T) -> StorageResult<()> {
  let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Serialization {
    key: key.to_string(),
    source,
  })?;
  store.put(key, &bytes)
}

impl SyncQueue {
  /// Load the queue and the dropped-job list from `store`.
  pub fn load(store: Arc<dyn StorageTier>) -> StorageResult<Self> {
    let jobs: VecDeque<SyncJob> = load_blob(store.as_ref(), QUEUE_KEY)?;
    let failed: Vec<FailedJob> = load_blob(store.as_ref(), FAILED_KEY)?;
    debug!(pending = jobs.len(), failed = failed.len(), "loaded sync queue");
    Ok(Self {
      store,
      jobs: Mutex::new(jobs),
      failed: Mutex::new(failed),
    })
  }

  fn jobs(&self) -> MutexGuard<'_, VecDeque<SyncJob>> {
    self.jobs.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn failed(&self) -> MutexGuard<'_, Vec<FailedJob>> {
    self.failed.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Append a job and persist. On a persist failure the job stays queued in memory.
  pub fn push(&self, job: SyncJob) -> StorageResult<()> {
    let mut jobs = self.jobs();
    jobs.push_back(job);
    save_blob(self.store.as_ref(), QUEUE_KEY, &*jobs)
  }

  /// Oldest pending job.
  pub fn front(&self) -> Option<SyncJob> {
    self.jobs().front().cloned()
  }

  /// Replace the stored copy of a job (after its retry count changed).
  pub fn update(&self, job: &SyncJob) -> StorageResult<()> {
    let mut jobs = self.jobs();
    if let Some(slot) = jobs.iter_mut().find(|j| j.id == job.id) {
      *slot = job.clone();
    }
    save_blob(self.store.as_ref(), QUEUE_KEY, &*jobs)
  }

  /// Remove a job that completed.
  pub fn remove(&self, id: &str) -> StorageResult<Option<SyncJob>> {
    let mut jobs = self.jobs();
    let position = jobs.iter().position(|j| j.id == id);
    let removed = position.and_then(|p| jobs.remove(p));
    if removed.is_some() {
      save_blob(self.store.as_ref(), QUEUE_KEY, &*jobs)?;
    }
    Ok(removed)
  }

  /// Move a job out of the queue into the dropped list.
  ///
  /// The in-memory move always happens; the returned error only reports
  /// that persisting it failed.
  pub fn drop_job(
    &self,
    job: SyncJob,
    error: String,
    now: DateTime<Utc>,
  ) -> (FailedJob, StorageResult<()>) {
    let failed_job = FailedJob {
      job,
      error,
      dropped_at: now,
    };

    let queue_result = {
      let mut jobs = self.jobs();
      jobs.retain(|j| j.id != failed_job.job.id);
      save_blob(self.store.as_ref(), QUEUE_KEY, &*jobs)
    };
    let failed_result = {
      let mut failed = self.failed();
      failed.push(failed_job.clone());
      save_blob(self.store.as_ref(), FAILED_KEY, &*failed)
    };

    (failed_job, queue_result.and(failed_result))
  }

  pub fn len(&self) -> usize {
    self.jobs().len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs().is_empty()
  }

  /// Pending jobs in FIFO order.
  pub fn pending(&self) -> Vec<SyncJob> {
    self.jobs().iter().cloned().collect()
  }

  pub fn failed_jobs(&self) -> Vec<FailedJob> {
    self.failed().clone()
  }

  pub fn failed_count(&self) -> usize {
    self.failed().len()
  }

  pub fn clear_failed(&self) -> StorageResult<()> {
    let mut failed = self.failed();
    failed.clear();
    self.store.delete(FAILED_KEY)
  }

  /// Drop every pending job without attempting it.
  pub fn clear(&self) -> StorageResult<()> {
    let mut jobs = self.jobs();
    jobs.clear();
    self.store.delete(QUEUE_KEY)
  }
}
