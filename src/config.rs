use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CachePolicy;
use crate::retry::RetryPolicy;
use crate::sync::ReplayConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub fetch: FetchConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base url of the REST API (e.g., "https://api.example.com/v1")
  pub url: String,
  /// Url probed for reachability (defaults to the base url)
  pub probe_url: Option<String>,
  #[serde(default = "default_probe_timeout", deserialize_with = "deserialize_duration")]
  pub probe_timeout: Duration,
}

fn default_probe_timeout() -> Duration {
  Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  #[serde(deserialize_with = "deserialize_duration")]
  pub ttl: Duration,
  pub stale_fraction: f64,
  pub stale_while_revalidate: bool,
  #[serde(deserialize_with = "deserialize_duration")]
  pub janitor_interval: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let policy = CachePolicy::default();
    Self {
      ttl: policy.ttl,
      stale_fraction: policy.stale_fraction,
      stale_while_revalidate: policy.stale_while_revalidate,
      janitor_interval: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  #[serde(deserialize_with = "deserialize_duration")]
  pub timeout: Duration,
  pub max_attempts: u32,
  #[serde(deserialize_with = "deserialize_duration")]
  pub base_delay: Duration,
  #[serde(deserialize_with = "deserialize_duration")]
  pub max_delay: Duration,
  /// Fraction of each delay randomized in both directions
  pub jitter: f64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      timeout: policy.timeout,
      max_attempts: policy.max_attempts,
      base_delay: policy.base_delay,
      max_delay: policy.max_delay,
      jitter: policy.jitter,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  #[serde(deserialize_with = "deserialize_duration")]
  pub base_delay: Duration,
  #[serde(deserialize_with = "deserialize_duration")]
  pub max_delay: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let replay = ReplayConfig::default();
    Self {
      max_retries: replay.max_retries,
      base_delay: replay.base_delay,
      max_delay: replay.max_delay,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  #[serde(deserialize_with = "deserialize_duration")]
  pub debounce: Duration,
  #[serde(deserialize_with = "deserialize_duration")]
  pub poll_interval: Duration,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      debounce: Duration::from_secs(1),
      poll_interval: Duration::from_secs(15),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Database file (defaults to $XDG_DATA_HOME/resync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Filter directive used when RESYNC_LOG is unset (defaults to "info")
  pub level: Option<String>,
  /// Log directory (defaults to $XDG_DATA_HOME/resync/logs)
  pub dir: Option<PathBuf>,
  /// Also log to stderr
  #[serde(default)]
  pub stderr: bool,
}

/// Accepts `"250ms"`, `"10s"`, `"5m"`, `"1h"`, or a bare number of seconds.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: serde::Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Secs(u64),
    Text(String),
  }

  match Raw::deserialize(deserializer)? {
    Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
    Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
  }
}

fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
  let text = text.trim();
  let split = text
    .find(|c: char| !c.is_ascii_digit())
    .unwrap_or(text.len());
  let (digits, unit) = text.split_at(split);
  let value: u64 = digits
    .parse()
    .map_err(|_| format!("invalid duration: {:?}", text))?;

  match unit.trim() {
    "ms" => Ok(Duration::from_millis(value)),
    "" | "s" => Ok(Duration::from_secs(value)),
    "m" => Ok(Duration::from_secs(value * 60)),
    "h" => Ok(Duration::from_secs(value * 3600)),
    other => Err(format!("unknown duration unit {:?} in {:?}", other, text)),
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./resync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/resync/config.yaml
  /// 4. ~/.config/resync/config.yaml
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
        "No configuration file found. Create one at ~/.config/resync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("resync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("resync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.cache.stale_fraction <= 0.0 || config.cache.stale_fraction > 1.0 {
      return Err(eyre!(
        "cache.stale_fraction must be in (0, 1], got {}",
        config.cache.stale_fraction
      ));
    }
    Ok(config)
  }

  /// Get the API token from the environment.
  ///
  /// Checks RESYNC_API_TOKEN. The token is optional; without it requests
  /// are sent unauthenticated.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RESYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn probe_url(&self) -> &str {
    self.remote.probe_url.as_deref().unwrap_or(&self.remote.url)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.fetch.max_attempts,
      base_delay: self.fetch.base_delay,
      max_delay: self.fetch.max_delay,
      jitter: self.fetch.jitter,
      timeout: self.fetch.timeout,
    }
  }

  pub fn cache_policy(&self) -> CachePolicy {
    CachePolicy {
      ttl: self.cache.ttl,
      stale_fraction: self.cache.stale_fraction,
      stale_while_revalidate: self.cache.stale_while_revalidate,
      retry: self.retry_policy(),
    }
  }

  pub fn replay_config(&self) -> ReplayConfig {
    ReplayConfig {
      max_retries: self.sync.max_retries,
      base_delay: self.sync.base_delay,
      max_delay: self.sync.max_delay,
      timeout: self.fetch.timeout,
    }
  }
}
