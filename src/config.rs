use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{TtlPolicy, DEFAULT_TIER_THRESHOLD_BYTES};
use crate::snapshot::ExportSettings;
use crate::sync::SyncSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub export: ExportConfig,
  /// Where the database, bulk files and logs live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Records requested per page when pulling a table
  #[serde(default = "default_page_size")]
  pub page_size: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_page_size() -> u64 {
  1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Entries written by another engine version read as misses
  pub engine_version: String,
  pub tier_threshold_bytes: usize,
  pub ttl: TtlConfig,
  pub fast_tier_quota_kb: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      engine_version: env!("CARGO_PKG_VERSION").to_string(),
      tier_threshold_bytes: DEFAULT_TIER_THRESHOLD_BYTES,
      ttl: TtlConfig::default(),
      fast_tier_quota_kb: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
  pub high_secs: i64,
  pub medium_secs: i64,
  pub low_secs: i64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      high_secs: 3600,
      medium_secs: 1800,
      low_secs: 600,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  pub retry_base_delay_ms: u64,
  pub retry_max_delay_ms: u64,
  /// How often the background probe checks the remote
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      retry_base_delay_ms: 500,
      retry_max_delay_ms: 30_000,
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
  /// Export only these tables instead of the remote's full list
  pub tables: Option<Vec<String>>,
  pub snapshot_ttl_hours: i64,
  /// Directory receiving downloadable manifests
  pub output_dir: Option<PathBuf>,
}

impl Default for ExportConfig {
  fn default() -> Self {
    Self {
      tables: None,
      snapshot_ttl_hours: 720,
      output_dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lexsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lexsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/lexsync/config.yaml\n\
                 See lexsync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("lexsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lexsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate YAML text.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.ttl_policy()?;
    if config.cache.tier_threshold_bytes == 0 {
      return Err(eyre!("cache.tier_threshold_bytes must be greater than zero"));
    }
    Ok(config)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks LEXSYNC_API_KEY first, then REMOTE_API_KEY as fallback. A
  /// missing key means unauthenticated requests.
  pub fn api_key() -> Option<String> {
    std::env::var("LEXSYNC_API_KEY")
      .or_else(|_| std::env::var("REMOTE_API_KEY"))
      .ok()
      .filter(|key| !key.is_empty())
  }

  pub fn ttl_policy(&self) -> Result<TtlPolicy> {
    let ttl = self.cache.ttl;
    TtlPolicy::new(
      chrono::Duration::seconds(ttl.high_secs),
      chrono::Duration::seconds(ttl.medium_secs),
      chrono::Duration::seconds(ttl.low_secs),
    )
    .map_err(|e| eyre!("cache.ttl: {}", e))
  }

  pub fn sync_settings(&self) -> SyncSettings {
    SyncSettings {
      max_retries: self.sync.max_retries,
      retry_base_delay: Duration::from_millis(self.sync.retry_base_delay_ms),
      retry_max_delay: Duration::from_millis(self.sync.retry_max_delay_ms),
      call_timeout: Duration::from_secs(self.remote.timeout_secs),
    }
  }

  pub fn export_settings(&self) -> ExportSettings {
    ExportSettings {
      tables: self.export.tables.clone(),
      snapshot_ttl: chrono::Duration::hours(self.export.snapshot_ttl_hours),
      call_timeout: Duration::from_secs(self.remote.timeout_secs),
      output_dir: self.export.output_dir.clone(),
    }
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn fast_tier_quota_bytes(&self) -> Option<u64> {
    self.cache.fast_tier_quota_kb.map(|kb| kb * 1024)
  }

  /// Resolved data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|dir| dir.join("lexsync"))
        .ok_or_else(|| eyre!("No platform data directory; set data_dir in the config file")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  url: https://portal.example/api\n").unwrap();
    assert_eq!(config.remote.timeout_secs, 30);
    assert_eq!(config.remote.page_size, 1000);
    assert_eq!(config.cache.tier_threshold_bytes, 51200);
    assert_eq!(config.cache.engine_version, env!("CARGO_PKG_VERSION"));
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.export.snapshot_ttl_hours, 720);

    let policy = config.ttl_policy().unwrap();
    assert_eq!(policy, TtlPolicy::default());
    assert_eq!(config.sync_settings(), SyncSettings::default());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
remote:
  url: http://localhost:8080
  timeout_secs: 5
cache:
  engine_version: "2.4.0"
  fast_tier_quota_kb: 512
  ttl:
    high_secs: 7200
    medium_secs: 900
    low_secs: 60
sync:
  max_retries: 5
  retry_base_delay_ms: 100
export:
  tables: [wilayas, courts]
  output_dir: /tmp/lexsync-out
data_dir: /var/lib/lexsync
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.fast_tier_quota_bytes(), Some(512 * 1024));
    assert_eq!(config.ttl_policy().unwrap().low, chrono::Duration::seconds(60));

    let sync = config.sync_settings();
    assert_eq!(sync.max_retries, 5);
    assert_eq!(sync.retry_base_delay, Duration::from_millis(100));
    assert_eq!(sync.call_timeout, Duration::from_secs(5));

    let export = config.export_settings();
    assert_eq!(
      export.tables,
      Some(vec!["wilayas".to_string(), "courts".to_string()])
    );
    assert_eq!(export.output_dir, Some(PathBuf::from("/tmp/lexsync-out")));
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/var/lib/lexsync"));
  }

  #[test]
  fn test_ttl_order_is_enforced() {
    let yaml = "remote:\n  url: http://x\ncache:\n  ttl:\n    high_secs: 60\n    medium_secs: 600\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/lexsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "remote:\n  url: http://127.0.0.1:9000\n").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.remote.url, "http://127.0.0.1:9000");
  }
}
