use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CachePolicy;
use crate::sync::{ConflictStrategy, SyncConfig};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub memory: MemoryConfig,
  pub network: NetworkConfig,
  pub sync: SyncSection,
  pub repository: RepositoryConfig,
  pub observability: ObservabilityConfig,
  pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
  /// Byte budget shared by every record in a store
  pub max_bytes: u64,
  /// SQLite file (defaults to $XDG_DATA_HOME/parrot/cache.db)
  pub db_path: Option<PathBuf>,
  /// Never touch SQLite, keep everything in memory
  pub force_memory: bool,
  pub schema_version: String,
  pub environment: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_bytes: 50 * 1024 * 1024,
      db_path: None,
      force_memory: false,
      schema_version: "v2.1".to_string(),
      environment: "production".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
  pub default_ttl_ms: u64,
  /// How often expired entries are swept; 0 disables the sweep
  pub prune_interval_ms: u64,
}

impl Default for MemoryConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 300_000,
      prune_interval_ms: 60_000,
    }
  }
}

impl MemoryConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn prune_interval(&self) -> Duration {
    Duration::from_millis(self.prune_interval_ms)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
  /// Assumed state until the first event or probe
  pub initial_online: bool,
  /// Target of the periodic HEAD probe; no probing when unset
  pub probe_url: Option<String>,
  pub check_interval_ms: u64,
  pub timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      initial_online: true,
      probe_url: None,
      check_interval_ms: 5_000,
      timeout_ms: 3_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSection {
  pub interval_ms: u64,
  pub max_retries: u32,
  pub retry_delay_ms: u64,
  pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncSection {
  fn default() -> Self {
    Self {
      interval_ms: 30_000,
      max_retries: 3,
      retry_delay_ms: 1_000,
      conflict_strategy: ConflictStrategy::ClientWins,
    }
  }
}

impl SyncSection {
  pub fn to_sync_config(&self) -> SyncConfig {
    SyncConfig {
      interval: Duration::from_millis(self.interval_ms),
      max_retries: self.max_retries,
      retry_delay: Duration::from_millis(self.retry_delay_ms),
      conflict_strategy: self.conflict_strategy,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepositoryConfig {
  pub default_policy: CachePolicy,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
  pub enabled: bool,
}

impl Default for ObservabilityConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
  /// Speech endpoint used by `parrot speak`
  pub url: Option<String>,
  pub provider: Option<String>,
  pub version: Option<String>,
  pub timeout_ms: u64,
}

impl Default for GeneratorConfig {
  fn default() -> Self {
    Self {
      url: None,
      provider: None,
      version: None,
      timeout_ms: 30_000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./parrot.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/parrot/config.yaml
  ///
  /// Defaults apply when no file is found.
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
    let local = PathBuf::from("parrot.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("parrot").join("config.yaml");
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

  pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty document means "all defaults".
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the speech provider token from the environment, if set.
  ///
  /// Checks PARROT_TTS_TOKEN.
  pub fn get_generator_token() -> Option<String> {
    std::env::var("PARROT_TTS_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
