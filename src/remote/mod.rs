//! Remote data service boundary.
//!
//! The engine only ever talks to the backend through `RemoteDataService`,
//! so the HTTP client can be swapped for a scripted double in tests.

mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpRemote;

use crate::error::RemoteResult;
use crate::sync::SyncJob;

/// A table exposed by the remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
  pub name: String,
  #[serde(default, alias = "approxCount")]
  pub approx_count: u64,
}

#[async_trait]
pub trait RemoteDataService: Send + Sync {
  /// Tables available for a full export.
  async fn list_tables(&self) -> RemoteResult<Vec<TableInfo>>;

  /// Every record of `table`.
  async fn fetch_all(&self, table: &str) -> RemoteResult<Vec<serde_json::Value>>;

  /// Apply one queued mutation.
  async fn apply_mutation(&self, job: &SyncJob) -> RemoteResult<()>;
}
