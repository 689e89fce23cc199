use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::WorkerConfig;

/// Shell assets precached at install time.
pub const DEFAULT_PRECACHE: [&str; 10] = [
  "./",
  "./index.html",
  "./styles.css",
  "./script.js",
  "./manifest.json",
  "./offline.html",
  "./assets/icons/icon-192.svg",
  "./assets/icons/icon-512.svg",
  "./assets/icons/icon-192.png",
  "./assets/icons/icon-512.png",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the one origin the worker serves
  pub origin: String,
  #[serde(default = "default_app_name")]
  pub app_name: String,
  /// Generation token; bumping it replaces the shell cache
  #[serde(default = "default_app_version")]
  pub app_version: String,
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  /// Placeholder served for images when offline (must also be precached)
  pub offline_image_fallback: Option<String>,
  #[serde(default = "default_max_image_entries")]
  pub max_image_entries: usize,
  /// Fail installation when any precache entry fails
  #[serde(default)]
  pub strict_install: bool,
  /// Upper bound on a single network fetch
  pub fetch_timeout_secs: Option<u64>,
  /// SQLite cache store (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  pub database: Option<PathBuf>,
  /// Total body bytes the in-memory store accepts
  pub memory_quota_bytes: Option<usize>,
}

fn default_app_name() -> String {
  "tapioca".to_string()
}

fn default_app_version() -> String {
  "1.0.1".to_string()
}

fn default_precache() -> Vec<String> {
  DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect()
}

fn default_offline_fallback() -> String {
  "./offline.html".to_string()
}

fn default_max_image_entries() -> usize {
  WorkerConfig::DEFAULT_MAX_IMAGE_ENTRIES
}

impl Config {
  /// A config with every default and the given origin.
  pub fn with_origin(origin: impl Into<String>) -> Self {
    Self {
      origin: origin.into(),
      app_name: default_app_name(),
      app_version: default_app_version(),
      precache: default_precache(),
      offline_fallback: default_offline_fallback(),
      offline_image_fallback: None,
      max_image_entries: default_max_image_entries(),
      strict_install: false,
      fetch_timeout_secs: None,
      database: None,
      memory_quota_bytes: None,
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// With no file anywhere, `origin` alone is enough to run on defaults.
  /// An `origin` given alongside a file overrides the file's.
  pub fn load(explicit_path: Option<&Path>, origin: Option<&str>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match (path, origin) {
      (Some(p), Some(origin)) => Config {
        origin: origin.to_string(),
        ..Self::load_from_path(&p)?
      },
      (Some(p), None) => Self::load_from_path(&p)?,
      (None, Some(origin)) => Self::with_origin(origin),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/shellcache/config.yaml\n\
                 or pass --origin."
        ))
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.app_version.trim().is_empty() {
      return Err(eyre!("app_version must not be empty"));
    }
    if self.max_image_entries == 0 {
      return Err(eyre!("max_image_entries must be at least 1"));
    }
    Ok(())
  }

  /// The origin as a base URL; a trailing slash is added so relative paths
  /// resolve inside it.
  pub fn origin_url(&self) -> Result<Url> {
    let mut origin = Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if !origin.path().ends_with('/') {
      let path = format!("{}/", origin.path());
      origin.set_path(&path);
    }
    Ok(origin)
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }

  /// The explicit worker configuration derived from this file.
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let origin = self.origin_url()?;
    let offline_image_fallback = self
      .offline_image_fallback
      .as_deref()
      .map(|p| self.resolve(p))
      .transpose()?;

    let config = WorkerConfig::new(
      &origin,
      &self.app_name,
      &self.app_version,
      &self.precache,
      &self.offline_fallback,
    )
    .map_err(|e| eyre!("Invalid precache entry: {}", e))?
    .with_max_image_entries(self.max_image_entries)
    .with_offline_image_fallback(offline_image_fallback)
    .with_strict_install(self.strict_install);

    Ok(config)
  }

  pub fn fetch_timeout(&self) -> Option<Duration> {
    self.fetch_timeout_secs.map(Duration::from_secs)
  }

  /// Where the SQLite store lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::cache::SqliteStorage::default_path().map_err(|e| eyre!("{}", e)),
    }
  }
}
