//! Configuration loading and management.
//!
//! voxd reads a single TOML file covering:
//! - Bind address and the shared TCP/UDP port
//! - Voice limits (per-speaker bandwidth ceiling, idle timeout, capacity)
//! - TLS certificate and key for the control channel
//! - Addresses refused before the TLS handshake starts

mod defaults;

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity and listen settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Voice datapath limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Optional TLS material for the control channel. Without it the
    /// control channel runs in plaintext, which is only fit for testing.
    pub tls: Option<TlsConfig>,
    /// Host addresses refused at accept, before TLS starts.
    #[serde(default)]
    pub banned: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address both listeners bind to.
    #[serde(default = "defaults::bind")]
    pub bind: IpAddr,
    /// Port shared by the TCP control channel and the UDP datapath.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Optional connect password checked during authentication.
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Per-speaker ceiling in bytes per second, measured on the wire.
    #[serde(default = "defaults::bandwidth")]
    pub bandwidth: u32,
    /// Seconds of silence on both transports before a user is dropped.
    #[serde(default = "defaults::timeout")]
    pub timeout: u32,
    /// Maximum number of concurrent users.
    #[serde(default = "defaults::max_users")]
    pub max_users: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: defaults::bind(),
            port: defaults::port(),
            password: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            bandwidth: defaults::bandwidth(),
            timeout: defaults::timeout(),
            max_users: defaults::max_users(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_users == 0 {
            return Err(ConfigError::Invalid("limits.max_users must be at least 1"));
        }
        if self.limits.bandwidth == 0 {
            return Err(ConfigError::Invalid("limits.bandwidth must be nonzero"));
        }
        if self.limits.timeout == 0 {
            return Err(ConfigError::Invalid("limits.timeout must be nonzero"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            tls: None,
            banned: Vec::new(),
        }
    }
}
