//! Configuration system for the DFS
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/dfs/config.toml
//! - Linux: ~/.config/dfs/config.toml
//! - Windows: %APPDATA%/dfs/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_LEASE_SECS, DEFAULT_SERVER_PORT};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client library settings
    pub client: ClientConfig,
    /// Coordinating server settings
    pub server: ServerConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on every server round trip, in milliseconds
    pub request_timeout_ms: u64,
    /// Bound on the identity handshake at mount time, in milliseconds
    pub connect_timeout_ms: u64,
    /// Default local storage path for the `dfs` CLI
    pub local_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            local_path: None,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Coordinating server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP port to listen on
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Write lease duration in milliseconds
    pub lease_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            lease_ms: DEFAULT_LEASE_SECS * 1000,
        }
    }
}

impl ServerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dfs").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default local storage directory for mounts
    pub fn default_local_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dfs").map(|dirs| dirs.data_local_dir().to_path_buf())
    }

    /// Effective local storage path (config override or system default)
    pub fn local_path(&self) -> PathBuf {
        self.client
            .local_path
            .clone()
            .or_else(Self::default_local_path)
            .unwrap_or_else(|| PathBuf::from("/tmp/dfs"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(config.server.lease(), Duration::from_secs(DEFAULT_LEASE_SECS));
        assert_eq!(config.client.request_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [server]
            lease_ms = 500
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.lease_ms, 500);
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(config.client.request_timeout_ms, 2_000);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[client]"));
        assert!(sample.contains("[server]"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.client.request_timeout_ms = 123;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.client.request_timeout_ms, 123);
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
    }
}
