//! Configuration file support for Dosewatch.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/dosewatch/config.toml`.

use crate::{Error, Result, UserId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Session defaults used when no user is given on the command line
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub user: Option<UserId>,
}

/// Recalculation timing and event retention
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("dosewatch")
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_retention_days() -> i64 {
    30
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("dosewatch").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.schedule.tick_interval_secs == 0 {
            return Err(Error::Config(
                "schedule.tick_interval_secs must be at least 1".into(),
            ));
        }
        if self.schedule.retention_days < 1 {
            return Err(Error::Config(
                "schedule.retention_days must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Period of the recalculation ticker
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.tick_interval_secs)
    }

    /// Location of the entity store snapshot
    pub fn store_path(&self) -> PathBuf {
        self.data.data_dir.join("store.json")
    }
}
