//! Error taxonomy for the cache and sync engine.
//!
//! Corrupt cache entries and version mismatches never reach callers; the
//! cache store treats both as misses.

use thiserror::Error;

/// Failure writing to (or managing) a storage tier.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("tier {tier} quota exceeded: {needed} bytes needed, {quota} bytes allowed")]
  QuotaExceeded {
    tier: &'static str,
    needed: u64,
    quota: u64,
  },

  #[error("failed to serialize entry {key}: {source}")]
  Serialization {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("stored value under {key} is unreadable: {source}")]
  Corrupt {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid storage key {0:?}")]
  InvalidKey(String),

  #[error("storage lock poisoned: {0}")]
  LockPoisoned(String),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Failure talking to the remote data service.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("remote call timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("remote returned status {status}: {body}")]
  Status { status: u16, body: String },

  #[error("invalid remote url: {0}")]
  Url(#[from] url::ParseError),

  #[error("remote rejected request: {0}")]
  Rejected(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// The sync queue could not be written to durable storage.
///
/// The job was still accepted in memory and carries `job_id`.
#[derive(Debug, Error)]
#[error("failed to persist sync queue (job {job_id} kept in memory): {source}")]
pub struct QueuePersistError {
  pub job_id: String,
  #[source]
  pub source: StorageError,
}

/// Errors from reading, writing or importing export manifests.
#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("failed to read manifest {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write manifest {path}: {source}")]
  Write {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("malformed manifest: {0}")]
  Format(#[from] serde_json::Error),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Remote(#[from] RemoteError),
}
