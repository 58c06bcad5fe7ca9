//! Storage tier backends: SQLite for small objects, a file directory for
//! bulk objects, and an in-memory map for tests and ephemeral runs.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::traits::StorageTier;
use crate::error::{StorageError, StorageResult};

/// Schema for the key/value tables.
const STORAGE_SCHEMA: &str = r#"
-- Namespaced key/value blobs (cache entries, sync queue state)
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_kv_store_namespace ON kv_store(namespace);
"#;

/// Shared SQLite connection. Several tiers can live in one database file,
/// each under its own namespace.
#[derive(Clone)]
pub struct SqliteDatabase {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    debug!(path = %path.display(), "opened sqlite storage");
    Ok(db)
  }

  /// Database that lives only as long as the process.
  pub fn open_in_memory() -> StorageResult<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  fn run_migrations(&self) -> StorageResult<()> {
    self.lock()?.execute_batch(STORAGE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

/// SQLite-backed tier bound to one namespace of a `SqliteDatabase`.
pub struct SqliteTier {
  db: SqliteDatabase,
  namespace: &'static str,
  quota_bytes: Option<u64>,
}

impl SqliteTier {
  pub fn new(db: SqliteDatabase, namespace: &'static str) -> Self {
    Self {
      db,
      namespace,
      quota_bytes: None,
    }
  }

  /// Reject writes that would push the namespace past `quota_bytes`.
  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }
}

impl StorageTier for SqliteTier {
  fn name(&self) -> &'static str {
    self.namespace
  }

  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    let conn = self.db.lock()?;
    let data = conn
      .query_row(
        "SELECT data FROM kv_store WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(data)
  }

  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    let conn = self.db.lock()?;

    if let Some(quota) = self.quota_bytes {
      let (total, existing): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(length(data)), 0),
                COALESCE(SUM(CASE WHEN key = ?2 THEN length(data) ELSE 0 END), 0)
         FROM kv_store WHERE namespace = ?1",
        params![self.namespace, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )?;
      let needed = (total - existing) as u64 + value.len() as u64;
      if needed > quota {
        return Err(StorageError::QuotaExceeded {
          tier: self.namespace,
          needed,
          quota,
        });
      }
    }

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (namespace, key, data, updated_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![self.namespace, key, value],
    )?;
    Ok(())
  }

  fn delete(&self, key: &str) -> StorageResult<()> {
    self.db.lock()?.execute(
      "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
      params![self.namespace, key],
    )?;
    Ok(())
  }

  fn get_all(&self) -> StorageResult<Vec<(String, Vec<u8>)>> {
    let conn = self.db.lock()?;
    let mut stmt = conn.prepare("SELECT key, data FROM kv_store WHERE namespace = ? ORDER BY key")?;
    let rows = stmt
      .query_map(params![self.namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
  }

  fn keys(&self) -> StorageResult<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE namespace = ? ORDER BY key")?;
    let keys = stmt
      .query_map(params![self.namespace], |row| row.get(0))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
  }

  fn size_bytes(&self) -> StorageResult<u64> {
    let conn = self.db.lock()?;
    let size: i64 = conn.query_row(
      "SELECT COALESCE(SUM(length(data)), 0) FROM kv_store WHERE namespace = ?",
      params![self.namespace],
      |row| row.get(0),
    )?;
    Ok(size as u64)
  }
}

/// File-per-key tier for large payloads.
///
/// Each file is named by the SHA-256 of its key and holds the key on the
/// first line followed by the raw payload. Writes land in a temp file that
/// is renamed into place.
pub struct FileTier {
  dir: PathBuf,
}

const FILE_EXTENSION: &str = "entry";

impl FileTier {
  pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
    let dir = dir.into();
    fs::create_dir_all(&dir)?;
    Ok(Self { dir })
  }

  fn path_for(&self, key: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let name = hex::encode(hasher.finalize());
    self.dir.join(format!("{}.{}", name, FILE_EXTENSION))
  }

  fn entry_files(&self) -> StorageResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for dir_entry in fs::read_dir(&self.dir)? {
      let path = dir_entry?.path();
      if path.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION) {
        files.push(path);
      }
    }
    files.sort();
    Ok(files)
  }

  fn remove_orphan(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  /// Split a stored file into key and payload. `None` when the key header is missing or unreadable.
  fn split(contents: &[u8]) -> Option<(String, Vec<u8>)> {
    let newline = contents.iter().position(|b| *b == b'\n')?;
    let key = String::from_utf8(contents[..newline].to_vec()).ok()?;
    Some((key, contents[newline + 1..].to_vec()))
  }
}

impl StorageTier for FileTier {
  fn name(&self) -> &'static str {
    "bulk"
  }

  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(self.path_for(key)) {
      Ok(contents) => match Self::split(&contents) {
        Some((_, payload)) => Ok(Some(payload)),
        // Hand back the raw bytes so the caller sees a corrupt entry and evicts it
        None => Ok(Some(contents)),
      },
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    if key.contains('\n') {
      return Err(StorageError::InvalidKey(key.to_string()));
    }

    let path = self.path_for(key);
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    {
      let mut file = fs::File::create(&tmp)?;
      file.write_all(key.as_bytes())?;
      file.write_all(b"\n")?;
      file.write_all(value)?;
      file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, &path) {
      let _ = fs::remove_file(&tmp);
      return Err(e.into());
    }
    Ok(())
  }

  fn delete(&self, key: &str) -> StorageResult<()> {
    match fs::remove_file(self.path_for(key)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  fn get_all(&self) -> StorageResult<Vec<(String, Vec<u8>)>> {
    let mut entries = Vec::new();
    for path in self.entry_files()? {
      match fs::read(&path) {
        Ok(contents) => match Self::split(&contents) {
          Some(entry) => entries.push(entry),
          None => {
            // No readable key, so nothing above this tier can address it
            warn!(path = %path.display(), "removing bulk file without a key header");
            Self::remove_orphan(&path)?;
          }
        },
        // Removed between listing and reading
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
      }
    }
    Ok(entries)
  }

  fn keys(&self) -> StorageResult<Vec<String>> {
    Ok(self.get_all()?.into_iter().map(|(key, _)| key).collect())
  }

  fn size_bytes(&self) -> StorageResult<u64> {
    Ok(
      self
        .get_all()?
        .iter()
        .map(|(_, payload)| payload.len() as u64)
        .sum(),
    )
  }
}

/// In-memory tier.
#[derive(Default)]
pub struct MemoryTier {
  name: &'static str,
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
  quota_bytes: Option<u64>,
  fail_writes: AtomicBool,
}

impl MemoryTier {
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      ..Self::default()
    }
  }

  pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
    self.quota_bytes = quota_bytes;
    self
  }

  /// Make every subsequent `put` and `delete` fail, simulating a read-only disk.
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self
      .entries
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

impl StorageTier for MemoryTier {
  fn name(&self) -> &'static str {
    self.name
  }

  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    let mut entries = self.lock()?;
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "writes disabled",
      )));
    }
    if let Some(quota) = self.quota_bytes {
      let total: u64 = entries.values().map(|v| v.len() as u64).sum();
      let existing = entries.get(key).map(|v| v.len() as u64).unwrap_or(0);
      let needed = total - existing + value.len() as u64;
      if needed > quota {
        return Err(StorageError::QuotaExceeded {
          tier: self.name,
          needed,
          quota,
        });
      }
    }
    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> StorageResult<()> {
    let mut entries = self.lock()?;
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "writes disabled",
      )));
    }
    entries.remove(key);
    Ok(())
  }

  fn get_all(&self) -> StorageResult<Vec<(String, Vec<u8>)>> {
    Ok(
      self
        .lock()?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  fn keys(&self) -> StorageResult<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn size_bytes(&self) -> StorageResult<u64> {
    Ok(self.lock()?.values().map(|v| v.len() as u64).sum())
  }
}
