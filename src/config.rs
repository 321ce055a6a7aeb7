use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::tasks::{FallbackPayload, Task};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL the app (and its shell assets) is served from
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      worker: WorkerConfig::default(),
      storage: StorageConfig::default(),
    }
  }
}

fn default_origin() -> String {
  "http://127.0.0.1:8000/".to_string()
}

/// Everything the routing engine needs to know about one worker version.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Version tag appended to partition names (e.g. "v1")
  pub version: String,
  pub shell_prefix: String,
  pub data_prefix: String,
  /// Path of the single dynamic data endpoint, relative to the origin
  pub data_endpoint: String,
  /// App shell paths fetched during install
  pub shell_assets: Vec<String>,
  /// Activate immediately after a successful install instead of waiting
  pub skip_waiting: bool,
  /// Replaces the built-in default task list
  pub fallback_tasks: Option<Vec<Task>>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    let mut shell_assets: Vec<String> = ["/", "/index.html", "/styles.css", "/app.js", "/manifest.json"]
      .into_iter()
      .map(String::from)
      .collect();
    shell_assets.extend(
      [72, 96, 128, 144, 152, 192, 384, 512]
        .into_iter()
        .map(|size| format!("/icons/icon-{}.png", size)),
    );

    Self {
      version: "v1".to_string(),
      shell_prefix: "app-shell".to_string(),
      data_prefix: "data-cache".to_string(),
      data_endpoint: "data.json".to_string(),
      shell_assets,
      skip_waiting: true,
      fallback_tasks: None,
    }
  }
}

impl WorkerConfig {
  /// Name of the partition holding shell assets for this version.
  pub fn shell_partition(&self) -> String {
    format!("{}-{}", self.shell_prefix, self.version)
  }

  /// Name of the partition holding data responses for this version.
  pub fn data_partition(&self) -> String {
    format!("{}-{}", self.data_prefix, self.version)
  }

  /// Partitions that survive the activation sweep.
  pub fn active_partitions(&self) -> BTreeSet<String> {
    [self.shell_partition(), self.data_partition()]
      .into_iter()
      .collect()
  }

  /// Whether a URL targets the dynamic data endpoint.
  ///
  /// Matches on whole trailing path segments, so `/data.json` and `/app/data.json`
  /// match while `/olddata.json` does not.
  pub fn is_data_request(&self, url: &Url) -> bool {
    let endpoint = self.data_endpoint.trim_start_matches('/');
    if endpoint.is_empty() {
      return false;
    }

    let path = url.path().trim_start_matches('/');
    path == endpoint || path.ends_with(&format!("/{}", endpoint))
  }

  pub fn fallback_payload(&self) -> serde_json::Result<FallbackPayload> {
    match &self.fallback_tasks {
      Some(tasks) => FallbackPayload::new(tasks.clone()),
      None => Ok(FallbackPayload::default()),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Persistent SQLite database
  #[default]
  Sqlite,
  /// Process memory, gone on exit
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// Database file (defaults to $XDG_DATA_HOME/taskshell/cache.db)
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  /// Database path, falling back to the data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("taskshell").join("cache.db"))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./taskshell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskshell/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("taskshell.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskshell").join("config.yaml");
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
    config.origin_url()?;
    Ok(config)
  }

  /// The origin as a parsed URL.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }
}
