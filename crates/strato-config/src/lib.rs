//! # strato-config
//!
//! Configuration management for stratofs clients.
//!
//! Loads configuration from:
//! 1. `~/.stratofs/config.toml` (global)
//! 2. `<mount>/.stratofs/config.toml` (per-mount, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|err| {
        eprintln!(
            "[strato-config] WARNING: failed to load config: {}. Using defaults.",
            err
        );
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility)
    pub config_version: u32,
    pub cache: CacheConfig,
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Local cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory.
    pub root: PathBuf,
    /// Repository this client mounts.
    pub repo_name: String,
    /// Share the cache directory between hosts (relaxed permissions,
    /// link+unlink renames on NFS).
    pub alien: bool,
    /// Managed cache size in bytes; 0 leaves the cache unmanaged.
    pub quota_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            repo_name: "default".to_string(),
            alien: false,
            quota_bytes: 0,
        }
    }
}

/// Transport settings forwarded to the download collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Repository base URLs, tried in order.
    pub hosts: Vec<String>,
    /// Probe between hosts on failures.
    pub probe_hosts: bool,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            probe_hosts: true,
            timeout_secs: 30,
        }
    }
}

fn default_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".stratofs")
        .join("cache")
}

impl Config {
    /// Load config from standard locations (CWD-relative mount config).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_mount(Path::new("."))
    }

    /// Load config for a specific mount directory.
    /// Resolution order: global → mount-local → env vars.
    pub fn load_for_mount(mount_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                config.merge_file(&global_path)?;
            }
        }

        let local_path = mount_root.join(".stratofs").join("config.toml");
        if local_path.exists() {
            config.merge_file(&local_path)?;
        }

        config.apply_env();
        Ok(config)
    }

    fn global_config_path() -> Option<PathBuf> {
        Some(dirs::home_dir()?.join(".stratofs").join("config.toml"))
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        debug!(path = %path.display(), "loading config file");
        let raw = std::fs::read_to_string(path)?;
        *self = toml::from_str(&raw)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("STRATOFS_CACHE_ROOT") {
            self.cache.root = PathBuf::from(root);
        }
        if let Ok(repo) = std::env::var("STRATOFS_REPO_NAME") {
            self.cache.repo_name = repo;
        }
        if let Ok(alien) = std::env::var("STRATOFS_ALIEN_CACHE") {
            self.cache.alien = alien == "1" || alien.eq_ignore_ascii_case("true");
        }
        if let Ok(quota) = std::env::var("STRATOFS_QUOTA_BYTES") {
            if let Ok(bytes) = quota.parse() {
                self.cache.quota_bytes = bytes;
            }
        }
    }
}
