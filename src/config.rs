//! Run configuration for the supervisor.
//!
//! Settings come from a TOML file and/or command-line flags, are validated
//! once at startup, and are read-only for the duration of the run.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Process-wide run configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Virtual network CIDR served by the tunnel (default: "192.168.69.1/24")
    #[serde(default = "default_network")]
    pub network: String,

    /// Address the tunnel server listens on (default: "0.0.0.0")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port the tunnel server listens on (default: 3234)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Virtual interface name override; empty lets the server choose
    #[serde(default)]
    pub interface_name: String,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to also log to a rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Emit JSON-formatted logs (default: false)
    #[serde(default)]
    pub log_json: bool,
}

fn default_network() -> String {
    "192.168.69.1/24".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3234
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            network: default_network(),
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            interface_name: String::new(),
            log_level: default_log_level(),
            log_to_file: false,
            log_dir: default_log_dir(),
            log_json: false,
        }
    }
}

impl RunConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the address fields parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network
            .parse::<Ipv4Net>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "network".to_string(),
                message: e.to_string(),
            })?;
        self.listen_address
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "listen_address".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Interface override, with the empty string meaning "none".
    pub fn interface_override(&self) -> Option<&str> {
        if self.interface_name.is_empty() {
            None
        } else {
            Some(&self.interface_name)
        }
    }
}
