//! Shepherd Configuration
//!
//! This module provides configuration structures for the election
//! coordinator: where the coordination service lives, which node paths
//! the election uses, and how sessions are timed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Shepherd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShepherdConfig {
    /// Coordination service connection configuration
    pub coordinator: CoordinatorConfig,

    /// Election node layout configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination service connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Coordination service endpoints (host:port)
    pub endpoints: Vec<String>,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Fixed delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// Election node layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Path of the ephemeral node whose owner is the master
    #[serde(default = "default_election_node")]
    pub election_node: String,

    /// Path of the persistent directory holding one ephemeral child per slave
    #[serde(default = "default_slaves_root")]
    pub slaves_root: String,

    /// Identity override (defaults to the hostname)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Time to wait after closing the session so ephemeral nodes are reclaimed
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_session_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_interval_ms() -> u64 {
    2000
}

fn default_election_node() -> String {
    "/master".to_string()
}

fn default_slaves_root() -> String {
    "/slaves".to_string()
}

fn default_terminate_grace_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_node: default_election_node(),
            slaves_root: default_slaves_root(),
            identity: None,
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl ShepherdConfig {
    /// Build a configuration for the given endpoints with every other field defaulted
    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            coordinator: CoordinatorConfig {
                endpoints,
                session_timeout_ms: default_session_timeout_ms(),
                reconnect_interval_ms: default_reconnect_interval_ms(),
            },
            election: ElectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ShepherdConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShepherdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML (used by `shepherd init`)
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.coordinator.endpoints.is_empty() {
            return Err(crate::Error::Config("coordinator.endpoints cannot be empty".into()));
        }

        if self.coordinator.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(crate::Error::Config("coordinator.endpoints contains an empty address".into()));
        }

        if self.coordinator.session_timeout_ms == 0 {
            return Err(crate::Error::Config("coordinator.session_timeout_ms must be positive".into()));
        }

        if self.coordinator.reconnect_interval_ms == 0 {
            return Err(crate::Error::Config("coordinator.reconnect_interval_ms must be positive".into()));
        }

        crate::coord::validate_path(&self.election.election_node)
            .map_err(|_| crate::Error::Config(format!(
                "election.election_node is not a valid node path: {}",
                self.election.election_node
            )))?;

        crate::coord::validate_path(&self.election.slaves_root)
            .map_err(|_| crate::Error::Config(format!(
                "election.slaves_root is not a valid node path: {}",
                self.election.slaves_root
            )))?;

        if self.election.election_node == "/" || self.election.slaves_root == "/" {
            return Err(crate::Error::Config("election paths cannot be the root node".into()));
        }

        if self.election.election_node == self.election.slaves_root
            || self.election.election_node.starts_with(&format!("{}/", self.election.slaves_root))
        {
            return Err(crate::Error::Config(
                "election.election_node must live outside election.slaves_root".into(),
            ));
        }

        if let Some(identity) = &self.election.identity {
            crate::identity::validate_identity(identity)?;
        }

        Ok(())
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator.session_timeout_ms)
    }

    /// Get reconnection interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.reconnect_interval_ms)
    }

    /// Get termination grace period as Duration
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.election.terminate_grace_ms)
    }

    /// Path of this identity's slave registration node
    pub fn slave_node(&self, identity: &str) -> String {
        format!("{}/{}", self.election.slaves_root, identity)
    }
}
