//! Configuration types for pblb

use crate::{PblbError, PblbResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Locations searched by [`Config::discover`], in order
pub const CONFIG_SEARCH_PATHS: &[&str] = &["/etc/pblb/config.toml", "config.toml"];

/// Main load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the proxy listener
    #[serde(default = "default_address")]
    pub address: String,
    /// Port for the proxy listener
    #[serde(default = "default_port")]
    pub port: u16,
    /// Load balancing method
    pub method: LoadBalanceMethod,
    /// Backend nodes
    pub nodes: Vec<NodeConfig>,
    /// Health check configuration
    #[serde(default)]
    pub health: HealthCheckConfig,
    /// Forwarding configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2839
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> PblbResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PblbError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> PblbResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the first configuration file found in [`CONFIG_SEARCH_PATHS`]
    pub fn discover() -> PblbResult<(PathBuf, Self)> {
        for candidate in CONFIG_SEARCH_PATHS {
            let path = PathBuf::from(candidate);
            if path.is_file() {
                let config = Self::from_file(&path)?;
                return Ok((path, config));
            }
        }

        Err(PblbError::Config(format!(
            "No config file found (searched {})",
            CONFIG_SEARCH_PATHS.join(", ")
        )))
    }

    /// Check the semantic constraints serde cannot express
    pub fn validate(&self) -> PblbResult<()> {
        let required = self.method.min_nodes();
        if self.nodes.len() < required {
            return Err(PblbError::InsufficientNodes {
                method: self.method.to_string(),
                required,
                found: self.nodes.len(),
            });
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if node.address.trim().is_empty() {
                return Err(PblbError::Config(format!("Node {} has an empty address", i)));
            }
            if node.port == 0 {
                return Err(PblbError::Config(format!(
                    "Node {} ({}) has port 0",
                    i, node.address
                )));
            }
        }

        if self.health.interval_secs == 0 {
            return Err(PblbError::Config(
                "health.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.health.timeout_secs == 0 {
            return Err(PblbError::Config(
                "health.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.proxy.timeout_secs == 0 {
            return Err(PblbError::Config(
                "proxy.timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load balancing method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalanceMethod {
    /// Sequential round-robin over healthy nodes
    RoundRobin,
    /// Power of two random choices by active connections
    TwoChoice,
}

impl LoadBalanceMethod {
    /// Minimum number of nodes the method can operate with
    pub fn min_nodes(&self) -> usize {
        match self {
            LoadBalanceMethod::RoundRobin => 1,
            LoadBalanceMethod::TwoChoice => 3,
        }
    }
}

impl std::fmt::Display for LoadBalanceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceMethod::RoundRobin => write!(f, "roundrobin"),
            LoadBalanceMethod::TwoChoice => write!(f, "twochoice"),
        }
    }
}

impl std::str::FromStr for LoadBalanceMethod {
    type Err = PblbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roundrobin" => Ok(LoadBalanceMethod::RoundRobin),
            "twochoice" => Ok(LoadBalanceMethod::TwoChoice),
            other => Err(PblbError::Config(format!(
                "Could not find a matching load balancing method \"{}\"",
                other
            ))),
        }
    }
}

/// A single backend node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host address
    pub address: String,
    /// Port number, given either as a string or an integer
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    /// Health check path
    #[serde(default = "default_health_path", deserialize_with = "deserialize_path")]
    pub health: String,
}

impl NodeConfig {
    /// Create a node config with the default health path
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            health: default_health_path(),
        }
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn deserialize_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid port \"{}\"", text))),
    }
}

fn deserialize_path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let path = String::deserialize(deserializer)?;
    if path.starts_with('/') {
        Ok(path)
    } else {
        Ok(format!("/{}", path))
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Health check interval in seconds
    pub interval_secs: u64,
    /// Timeout for a single probe in seconds
    pub timeout_secs: u64,
}

impl HealthCheckConfig {
    /// Interval between probe cycles
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Timeout for a single probe
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 5,
        }
    }
}

/// Request forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Timeout for a forwarded request, in seconds
    pub timeout_secs: u64,
    /// Largest request body that will be buffered
    pub max_body_bytes: usize,
}

impl ProxyConfig {
    /// Timeout for a forwarded request
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_bytes: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
