//! Core configuration types and loading.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use super::features::FeaturesConfig;
use super::limits::LimitsConfig;
use super::timing::TimingConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// State backend selection.
///
/// A closed set resolved once at startup; there is no runtime type
/// inspection anywhere downstream of this choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Single-process maps; the only instance is this one.
    #[default]
    Memory,
    /// All records live in a shared key-value store reachable by every
    /// instance of the cluster.
    Store,
}

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server identity and backend selection.
    #[serde(default)]
    pub server: ServerConfig,
    /// Feature toggles.
    #[serde(default)]
    pub features: FeaturesConfig,
    /// Size limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Timeouts and periods.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen port handed to the transport collaborator.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cluster instance id. Generated (uuid v4) when absent.
    pub instance_id: Option<String>,
    /// State backend selection.
    #[serde(default)]
    pub state: StateKind,
    /// Encode wire errors as `{name, args}` objects instead of name strings.
    #[serde(default)]
    pub use_raw_error_objects: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            instance_id: None,
            state: StateKind::default(),
            use_raw_error_objects: false,
        }
    }
}

fn default_port() -> u16 {
    8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.state, StateKind::Memory);
        assert!(!config.server.use_raw_error_objects);
        assert!(!config.features.enable_direct_messages);
    }

    #[test]
    fn parses_full_surface() {
        let toml = r#"
            [server]
            port = 9001
            instance_id = "node-1"
            state = "store"
            use_raw_error_objects = true

            [features]
            enable_direct_messages = true
            enable_rooms_management = true

            [limits]
            history_max_size = 50

            [timing]
            lock_ttl_ms = 2000
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.state, StateKind::Store);
        assert_eq!(config.server.instance_id.as_deref(), Some("node-1"));
        assert!(config.features.enable_rooms_management);
        assert_eq!(config.limits.history_max_size, 50);
        assert_eq!(config.timing.lock_ttl_ms, 2000);
    }
}
