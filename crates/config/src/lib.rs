//! Configuration management for Loremaster
//!
//! Loads and saves table parameters from the local vault. Every section
//! has sensible defaults so a missing file means a working table.

use loremaster_cache::PolicyTable;
use loremaster_monitor::AlertThresholds;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod paths;

pub use paths::{config_path, data_dir, snapshots_dir};

/// Errors in configuration systems
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Dispatch defaults for the table itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefaults {
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_fan_out_deadline_seconds")]
    pub fan_out_deadline_seconds: u64,
}

impl Default for TableDefaults {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            fan_out_deadline_seconds: default_fan_out_deadline_seconds(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_fan_out_deadline_seconds() -> u64 {
    10
}

/// Cache sizing, sweep cadence, and the per-class policy table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default)]
    pub classes: PolicyTable,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            classes: PolicyTable::default(),
        }
    }
}

fn default_cache_capacity() -> usize {
    256
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

/// Adaptive recovery knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_exploration_rate")]
    pub exploration_rate: f64,
    #[serde(default = "default_max_redispatch_attempts")]
    pub max_redispatch_attempts: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            exploration_rate: default_exploration_rate(),
            max_redispatch_attempts: default_max_redispatch_attempts(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_exploration_rate() -> f64 {
    0.10
}

fn default_max_redispatch_attempts() -> u32 {
    2
}

fn default_history_limit() -> usize {
    256
}

/// Monitor window and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_window")]
    pub window: usize,
    #[serde(default)]
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: default_monitor_window(),
            thresholds: AlertThresholds::default(),
        }
    }
}

fn default_monitor_window() -> usize {
    512
}

/// Root table parameters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub table: TableDefaults,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load table parameters from the vault
    pub async fn load() -> Result<Self> {
        let path = config_path();
        Self::load_from(&path).await
    }

    /// Load from a specific location; a missing file means defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("no config at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        debug!("loading config from {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save table parameters to the vault
    pub async fn save(&self) -> Result<()> {
        let path = config_path();
        self.save_to(&path).await
    }

    /// Save to a specific location
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        debug!("saving config to {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.table.default_timeout_seconds)
    }

    pub fn fan_out_deadline(&self) -> Duration {
        Duration::from_secs(self.table.fan_out_deadline_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_seconds)
    }
}

/// Initialize the vault: config file plus snapshot directory
pub async fn init() -> Result<Config> {
    let config_path = config_path();

    if config_path.exists() {
        warn!("config already present at {:?}", config_path);
    } else {
        let config = Config::default();
        config.save().await?;
        info!("config established at {:?}", config_path);
    }

    let snapshots = snapshots_dir();
    tokio::fs::create_dir_all(&snapshots).await?;
    info!("snapshot vault ready at {:?}", snapshots);

    Config::load().await
}
