//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MUXRPC_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Call dispatch configuration.
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Load from file if specified
        if let Ok(path) = std::env::var("MUXRPC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        // Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.dispatch.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Checks settings that have no usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.network.read_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "network.read_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the runtime server configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.network.bind_addr,
            max_connections: self.network.max_connections,
            read_buffer_size: self.network.read_buffer_size,
            max_in_flight_calls: self.dispatch.max_in_flight_calls,
            overload_policy: self.dispatch.overload_policy,
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Read buffer size for socket reads, in bytes.
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], muxrpc_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MUXRPC_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("MUXRPC_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(size) = std::env::var("MUXRPC_READ_BUFFER") {
            if let Ok(n) = size.parse() {
                self.read_buffer_size = n;
            }
        }
    }
}

/// What the server does with a call once a connection's in-flight limit
/// is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadPolicy {
    /// Stop reading from the connection until a call completes.
    #[default]
    Wait,
    /// Answer immediately with an overload error.
    Reject,
}

impl std::str::FromStr for OverloadPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wait" => Ok(OverloadPolicy::Wait),
            "reject" => Ok(OverloadPolicy::Reject),
            other => Err(ConfigError::ValidationError(format!(
                "unknown overload policy '{}'",
                other
            ))),
        }
    }
}

/// Call dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum calls handled at once per connection (0 = unlimited).
    pub max_in_flight_calls: usize,
    /// Behaviour once the limit is reached.
    pub overload_policy: OverloadPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight_calls: 1024,
            overload_policy: OverloadPolicy::Wait,
        }
    }
}

impl DispatchConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("MUXRPC_MAX_IN_FLIGHT") {
            if let Ok(n) = max.parse() {
                self.max_in_flight_calls = n;
            }
        }

        if let Ok(policy) = std::env::var("MUXRPC_OVERLOAD") {
            match policy.parse() {
                Ok(parsed) => self.overload_policy = parsed,
                Err(e) => tracing::warn!("Ignoring MUXRPC_OVERLOAD: {}", e),
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
