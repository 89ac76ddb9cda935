use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::PartitionLimits;
use crate::classify::{default_rules, ClassificationRule};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application is served from; every request is forwarded here
  pub origin: Url,
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Deployed version; names this version's partitions
  pub version: String,
  /// Where the relay database and log files live
  pub data_dir: Option<PathBuf>,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  /// How often the origin is probed to detect reconnection
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
  /// Precached page served to offline navigations
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Fetched into the static partition on install
  #[serde(default)]
  pub precache: Vec<String>,
  #[serde(default)]
  pub partitions: PartitionLimits,
  /// Ordered classification rules; first match wins
  #[serde(default = "default_rules")]
  pub rules: Vec<ClassificationRule>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter directive used when no env filter is set
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Also write daily-rotated log files under the data directory
  #[serde(default)]
  pub file: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: false,
    }
  }
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8787))
}

fn default_request_timeout() -> u64 {
  15
}

fn default_probe_interval() -> u64 {
  10
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-relay/config.yaml
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
        "No configuration file found. Create one at ~/.config/offline-relay/config.yaml\n\
                 See offline-relay.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-relay").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    if config.version.trim().is_empty() {
      return Err(eyre!("`version` must not be empty"));
    }
    if config.origin.cannot_be_a_base() {
      return Err(eyre!("`origin` must be an http(s) URL, got {}", config.origin));
    }

    Ok(config)
  }

  /// Data directory, defaulting to the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-relay"))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}
