//! Scripted in-process remote used by tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteDataService, TableInfo};
use crate::connectivity::ReachabilityProbe;
use crate::error::{RemoteError, RemoteResult};
use crate::sync::SyncJob;

#[derive(Default)]
pub struct MockRemote {
  tables: Mutex<BTreeMap<String, Vec<serde_json::Value>>>,
  failing_tables: Mutex<HashSet<String>>,
  /// job id -> number of attempts that should still fail
  mutation_failures: Mutex<HashMap<String, u32>>,
  /// Every attempt in call order, successful or not
  attempts: Mutex<Vec<String>>,
  applied: Mutex<Vec<String>>,
  mutation_delay: Mutex<Option<Duration>>,
  reachable: AtomicBool,
}

impl MockRemote {
  pub fn new() -> Self {
    let remote = Self::default();
    remote.reachable.store(true, Ordering::SeqCst);
    remote
  }

  pub fn with_table(self, name: &str, records: Vec<serde_json::Value>) -> Self {
    self.tables.lock().unwrap().insert(name.to_string(), records);
    self
  }

  pub fn fail_table(&self, name: &str) {
    self.failing_tables.lock().unwrap().insert(name.to_string());
  }

  pub fn fail_job(&self, job_id: &str, times: u32) {
    self
      .mutation_failures
      .lock()
      .unwrap()
      .insert(job_id.to_string(), times);
  }

  pub fn set_mutation_delay(&self, delay: Option<Duration>) {
    *self.mutation_delay.lock().unwrap() = delay;
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn attempts(&self) -> Vec<String> {
    self.attempts.lock().unwrap().clone()
  }

  pub fn applied(&self) -> Vec<String> {
    self.applied.lock().unwrap().clone()
  }
}

#[async_trait]
impl RemoteDataService for MockRemote {
  async fn list_tables(&self) -> RemoteResult<Vec<TableInfo>> {
    Ok(
      self
        .tables
        .lock()
        .unwrap()
        .iter()
        .map(|(name, records)| TableInfo {
          name: name.clone(),
          approx_count: records.len() as u64,
        })
        .collect(),
    )
  }

  async fn fetch_all(&self, table: &str) -> RemoteResult<Vec<serde_json::Value>> {
    if self.failing_tables.lock().unwrap().contains(table) {
      return Err(RemoteError::Status {
        status: 500,
        body: format!("table {} unavailable", table),
      });
    }
    self
      .tables
      .lock()
      .unwrap()
      .get(table)
      .cloned()
      .ok_or_else(|| RemoteError::Status {
        status: 404,
        body: format!("no table {}", table),
      })
  }

  async fn apply_mutation(&self, job: &SyncJob) -> RemoteResult<()> {
    self.attempts.lock().unwrap().push(job.id.clone());

    let delay = *self.mutation_delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    {
      let mut failures = self.mutation_failures.lock().unwrap();
      if let Some(remaining) = failures.get_mut(&job.id) {
        if *remaining > 0 {
          *remaining -= 1;
          return Err(RemoteError::Rejected(format!("scripted failure for {}", job.id)));
        }
      }
    }

    self.applied.lock().unwrap().push(job.id.clone());
    Ok(())
  }
}

#[async_trait]
impl ReachabilityProbe for MockRemote {
  async fn is_reachable(&self) -> bool {
    self.reachable.load(Ordering::SeqCst)
  }
}
