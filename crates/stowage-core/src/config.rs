//! Configuration for hosts and repositories.
//!
//! The configuration file lives at `~/.config/stowage/config.json`. Every
//! field has a default, so a missing file or missing keys are fine.
//! `STOWAGE_API_ROOT`, `STOWAGE_TOKEN` and `STOWAGE_DATA_DIR` override the
//! file when set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::remote::client::DEFAULT_REQUEST_TIMEOUT_SECS;

/// Application name used for config/data directory paths
const APP_NAME: &str = "stowage";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_ROOT: &str = "http://localhost:9090/";

/// Sync tick period.
/// 500ms keeps the remote close to the local state without flooding it.
const DEFAULT_SYNC_INTERVAL_MS: u64 = 500;

/// Actions sent per tick.
const DEFAULT_MAX_ITEMS_PER_FLUSH: usize = 50;

/// Errors tolerated in one pass; one more latches the engine.
const DEFAULT_MAX_ERRORS_BEFORE_LATCH: u32 = 3;

/// Time a latched engine waits before probing the remote again.
const DEFAULT_LATCH_COOLDOWN_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_ms: u64,
    pub max_items_per_flush: usize,
    pub max_errors_before_latch: u32,
    /// `None` keeps the engine latched until a manual reset.
    pub latch_cooldown_secs: Option<u64>,
    pub request_timeout_secs: u64,
    pub persist_queue: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            max_items_per_flush: DEFAULT_MAX_ITEMS_PER_FLUSH,
            max_errors_before_latch: DEFAULT_MAX_ERRORS_BEFORE_LATCH,
            latch_cooldown_secs: Some(DEFAULT_LATCH_COOLDOWN_SECS),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            persist_queue: true,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn latch_cooldown(&self) -> Option<Duration> {
        self.latch_cooldown_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_root: String,
    pub token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_root: DEFAULT_API_ROOT.to_string(),
            token: None,
            data_dir: None,
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(root) = var("STOWAGE_API_ROOT") {
            self.api_root = root;
        }
        if let Some(token) = var("STOWAGE_TOKEN") {
            self.token = Some(token);
        }
        if let Some(dir) = var("STOWAGE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for persisted snapshots and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
