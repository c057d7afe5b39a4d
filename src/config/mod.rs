//! Configuration module
//!
//! Handles loading and saving z21link configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::StationConfig;
use crate::protocol::{ThrottleSteps, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Command station settings
    #[serde(default)]
    pub station: StationSection,

    /// Locomotive defaults
    #[serde(default)]
    pub loco: LocoConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Command station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSection {
    /// Station host name or IP address
    #[serde(default = "default_host")]
    pub host: String,
    /// UDP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reply timeout in ms
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Keep-alive interval in ms
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
}

fn default_host() -> String {
    "192.168.0.111".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> u64 {
    2000
}

fn default_keepalive_interval() -> u64 {
    20_000
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout(),
            keepalive_interval_ms: default_keepalive_interval(),
        }
    }
}

/// Locomotive configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocoConfig {
    /// Throttle steps for new controllers: 14, 28 or 128
    #[serde(default)]
    pub default_steps: ThrottleSteps,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("z21link/config.toml")),
            Some(PathBuf::from("./z21link.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Session settings for the configured station
    pub fn station_config(&self) -> StationConfig {
        let mut config = StationConfig::new(self.station.host.clone())
            .with_port(self.station.port)
            .with_timeout(Duration::from_millis(self.station.timeout_ms))
            .with_keepalive_interval(Duration::from_millis(self.station.keepalive_interval_ms));
        config.default_steps = self.loco.default_steps;
        config
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        station: StationSection {
            host: "z21.local".to_string(),
            ..Default::default()
        },
        loco: LocoConfig {
            default_steps: ThrottleSteps::Steps28,
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
