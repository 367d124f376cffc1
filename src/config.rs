use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  /// Mutation kind -> REST endpoint
  #[serde(default = "default_endpoints")]
  pub endpoints: BTreeMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Origin of the application; also decides what counts as same-origin
  pub base_url: Url,
  /// Per-request timeout; must stay below the flush lease TTL
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
}

impl ServerConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Deployed version, used as the prefix of both cache names
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Assets needed to boot with zero network access
  #[serde(default = "default_shell_assets")]
  pub shell_assets: Vec<String>,
  /// Document served when a navigation misses the cache while offline
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: Option<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      shell_assets: default_shell_assets(),
      offline_fallback: default_offline_fallback(),
    }
  }
}

impl CacheConfig {
  pub fn shell_cache_name(&self) -> String {
    format!("{}-shell", self.version)
  }

  pub fn runtime_cache_name(&self) -> String {
    format!("{}-runtime", self.version)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Failed flush attempts before an item becomes terminally failed
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_lease_ttl_secs")]
  pub lease_ttl_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      lease_ttl_secs: default_lease_ttl_secs(),
    }
  }
}

impl QueueConfig {
  pub fn lease_ttl(&self) -> Duration {
    Duration::from_secs(self.lease_ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Tag the deferred-retry facility uses for this subsystem
  #[serde(default = "default_sync_tag")]
  pub tag: String,
  #[serde(default = "default_handshake_timeout_secs")]
  pub handshake_timeout_secs: u64,
  #[serde(default)]
  pub retry: RetryConfig,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
      handshake_timeout_secs: default_handshake_timeout_secs(),
      retry: RetryConfig::default(),
    }
  }
}

impl SyncConfig {
  pub fn handshake_timeout(&self) -> Duration {
    Duration::from_secs(self.handshake_timeout_secs)
  }
}

/// Backoff applied by the deferred-retry facility between sync attempts.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_initial_delay_secs")]
  pub initial_delay_secs: u64,
  #[serde(default = "default_max_delay_secs")]
  pub max_delay_secs: u64,
  #[serde(default = "default_factor")]
  pub factor: f64,
  /// Attempts before a registration is dropped until re-armed
  #[serde(default = "default_retry_max_attempts")]
  pub max_attempts: u32,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      initial_delay_secs: default_initial_delay_secs(),
      max_delay_secs: default_max_delay_secs(),
      factor: default_factor(),
      max_attempts: default_retry_max_attempts(),
    }
  }
}

impl RetryConfig {
  /// Delay before the attempt following `failures` consecutive failures.
  pub fn delay_after(&self, failures: u32) -> Duration {
    let max = Duration::from_secs(self.max_delay_secs);
    let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = self.initial_delay_secs as f64 * self.factor.powi(exponent);
    if !secs.is_finite() || secs < 0.0 {
      return max;
    }
    // Clamp before converting; Duration cannot hold arbitrary f64 seconds
    Duration::try_from_secs_f64(secs.min(self.max_delay_secs as f64))
      .unwrap_or(max)
      .min(max)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_path: default_probe_path(),
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
  #[serde(default = "default_method")]
  pub method: String,
  /// Path relative to the base URL; `{field}` is filled from the payload
  pub path: String,
}

fn default_request_timeout_secs() -> u64 {
  30
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_shell_assets() -> Vec<String> {
  vec![
    "/".to_string(),
    "/index.html".to_string(),
    "/manifest.json".to_string(),
  ]
}

fn default_offline_fallback() -> Option<String> {
  Some("/offline.html".to_string())
}

fn default_max_attempts() -> u32 {
  5
}

fn default_lease_ttl_secs() -> u64 {
  120
}

fn default_sync_tag() -> String {
  "sync-inspections".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
  30
}

fn default_initial_delay_secs() -> u64 {
  5
}

fn default_max_delay_secs() -> u64 {
  300
}

fn default_factor() -> f64 {
  2.0
}

fn default_retry_max_attempts() -> u32 {
  3
}

fn default_probe_path() -> String {
  "/api/health".to_string()
}

fn default_probe_interval_secs() -> u64 {
  15
}

fn default_method() -> String {
  "POST".to_string()
}

fn default_endpoints() -> BTreeMap<String, EndpointConfig> {
  let mut endpoints = BTreeMap::new();
  endpoints.insert(
    "create-maintenance-request".to_string(),
    EndpointConfig {
      method: "POST".to_string(),
      path: "/api/maintenance-requests".to_string(),
    },
  );
  endpoints.insert(
    "upsert-inspection-entry".to_string(),
    EndpointConfig {
      method: "PUT".to_string(),
      path: "/api/inspections/{inspection_id}/entries/{field_id}".to_string(),
    },
  );
  endpoints
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml"
      )),
    }
  }

  /// Minimal configuration pointing at `base_url`, everything else defaulted.
  pub fn for_origin(base_url: Url) -> Self {
    Self {
      server: ServerConfig {
        base_url,
        request_timeout_secs: default_request_timeout_secs(),
      },
      cache: CacheConfig::default(),
      queue: QueueConfig::default(),
      sync: SyncConfig::default(),
      connectivity: ConnectivityConfig::default(),
      endpoints: default_endpoints(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.queue.max_attempts == 0 {
      return Err(eyre!("queue.max_attempts must be at least 1"));
    }
    if !(config.sync.retry.factor >= 1.0 && config.sync.retry.factor.is_finite()) {
      return Err(eyre!(
        "sync.retry.factor must be a finite number >= 1.0, got {}",
        config.sync.retry.factor
      ));
    }
    if config.server.request_timeout_secs == 0
      || config.server.request_timeout_secs >= config.queue.lease_ttl_secs
    {
      return Err(eyre!(
        "server.request_timeout_secs must be between 1 and queue.lease_ttl_secs ({})",
        config.queue.lease_ttl_secs
      ));
    }
    Ok(config)
  }

  /// Default location of the queue and cache database.
  pub fn default_db_path() -> Result<PathBuf> {
    Ok(Self::data_dir()?.join("fieldsync.db"))
  }

  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync"))
  }

  /// Get the session token the page context sends with mutations.
  ///
  /// Returns None when FIELDSYNC_API_TOKEN is unset.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
