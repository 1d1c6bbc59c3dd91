/*!
Configuration management for the radar monitor.
*/

use std::path::Path;

use anyhow::{Context, Result};
use ld2450::SensorConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub monitor: MonitorConfig,
    pub sensor: SensorConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        config
            .sensor
            .validate()
            .with_context(|| format!("Invalid sensor section in {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load the file if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            info!("No config file at {}, using defaults", path.as_ref().display());
            Ok(Self::new())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Connection to the serial-to-TCP bridge the sensor is attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bridge address as `host:port`
    pub address: String,

    /// Socket receive buffer size in bytes
    pub recv_buffer_size: usize,

    /// Channel buffer size for received chunks
    pub channel_buffer_size: usize,

    /// Enable TCP keepalive on the bridge connection
    pub keepalive: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8899".to_string(),
            recv_buffer_size: 64 * 1024,
            channel_buffer_size: 1000,
            keepalive: true,
        }
    }
}

/// Output and pacing of the monitor loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay between poll iterations
    pub poll_interval_ms: u64,

    /// Print JSON lines instead of text
    pub json_output: bool,

    /// Statistics reporting interval in seconds (0 disables)
    pub stats_interval_seconds: u64,

    /// Bytes handed to the decoder per replay step
    pub replay_chunk_size: usize,

    /// Delay between replay steps
    pub replay_chunk_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            json_output: false,
            stats_interval_seconds: 10,
            replay_chunk_size: 30,
            replay_chunk_interval_ms: 10,
        }
    }
}
