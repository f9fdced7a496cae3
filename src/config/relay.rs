//! Relay configuration file
//!
//! Optional TOML file tuning fan-out behaviour and per-connection transport
//! limits. Every key may be omitted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::relay::{RouterConfig, DEFAULT_OUTBOUND_QUEUE};

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Transport limits applied to every connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub router: RouterConfig,
    pub transport: TransportConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from `path` if one was given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Stop echoing broadcasts back to their sender
    pub fn exclude_sender(mut self) -> Self {
        self.router.include_sender = false;
        self
    }

    /// Relay raw payloads without the sender tag
    pub fn untagged(mut self) -> Self {
        self.router.tag_sender = false;
        self
    }
}
