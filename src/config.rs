use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resource::FacadeOptions;
use crate::sync::{GovernorOptions, PollOptions};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the REST API, e.g. `https://api.example.org/v1/`
  pub url: String,
  /// Default resource kind (collection path segment)
  #[serde(default = "default_resource")]
  pub resource: String,
}

fn default_resource() -> String {
  "documents".to_string()
}

/// Sync tuning knobs. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  pub debounce_ms: u64,
  pub poll_interval_ms: u64,
  pub max_retries: u32,
  pub min_request_spacing_ms: u64,
  pub timeout_ms: u64,
  pub base_delay_ms: u64,
  pub throttle_backoff_cap_ms: u64,
  pub max_consecutive_throttles: u32,
  /// How long a persisted snapshot may answer reads without the network
  pub stale_after_ms: u64,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      debounce_ms: 2_000,
      poll_interval_ms: 10_000,
      max_retries: 3,
      min_request_spacing_ms: 2_000,
      timeout_ms: 15_000,
      base_delay_ms: 500,
      throttle_backoff_cap_ms: 10_000,
      max_consecutive_throttles: 3,
      stale_after_ms: 0,
    }
  }
}

impl SyncSettings {
  pub fn governor_options(&self) -> GovernorOptions {
    GovernorOptions {
      max_retries: self.max_retries,
      timeout: Duration::from_millis(self.timeout_ms),
      base_delay: Duration::from_millis(self.base_delay_ms),
      ..GovernorOptions::default()
    }
  }

  pub fn poll_options(&self) -> PollOptions {
    PollOptions {
      interval: Duration::from_millis(self.poll_interval_ms),
      min_spacing: Duration::from_millis(self.min_request_spacing_ms),
      throttle_backoff_cap: Duration::from_millis(self.throttle_backoff_cap_ms),
      max_consecutive_throttles: self.max_consecutive_throttles.max(1),
    }
  }

  pub fn facade_options(&self) -> FacadeOptions {
    FacadeOptions {
      debounce: Duration::from_millis(self.debounce_ms),
      governor: self.governor_options(),
      poll: self.poll_options(),
      stale_after: chrono::Duration::milliseconds(self.stale_after_ms.min(i64::MAX as u64) as i64),
      ..FacadeOptions::default()
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Persist snapshots and unsaved edits locally
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/orgsync/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is not set
  pub level: String,
  /// Log directory (default: $XDG_DATA_HOME/orgsync/logs)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl LogConfig {
  pub fn dir(&self) -> Result<PathBuf> {
    match &self.dir {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|d| d.join("orgsync").join("logs"))
        .ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./orgsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/orgsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/orgsync/config.yaml\n\
                 See orgsync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("orgsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("orgsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks ORGSYNC_TOKEN first, then ORGSYNC_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("ORGSYNC_TOKEN")
      .or_else(|_| std::env::var("ORGSYNC_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set ORGSYNC_TOKEN or ORGSYNC_API_TOKEN environment variable.")
      })
  }
}
