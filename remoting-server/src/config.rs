//! Daemon configuration.
//!
//! Sources, each overriding the one before:
//! 1. built-in defaults
//! 2. the YAML file named by `REMOTING_CONFIG`
//! 3. `REMOTING_*` environment variables

use remoting_registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Daemon configuration. Every section may be omitted from the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub registry: RegistrySettings,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Resolves all three sources and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("REMOTING_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file without applying the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Defaults plus the environment; no file is read.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.registry.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "network.max_inflight must be at least 1".to_string(),
            ));
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.registry.enabled && self.registry.store.namespace.contains('/') {
            return Err(ConfigError::Validation(format!(
                "registry namespace '{}' must be a single path segment",
                self.registry.store.namespace
            )));
        }
        if self.registry.enabled
            && !self.registry.store.is_in_process()
            && !self.registry.store.connect_string.contains(':')
        {
            return Err(ConfigError::Validation(format!(
                "registry connect string '{}' must be 'memory' or host:port",
                self.registry.store.connect_string
            )));
        }
        Ok(())
    }

    /// Writes the configuration back as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Listener and session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Host published in provider records. Defaults to the bind IP.
    pub advertise_host: Option<String>,
    /// Sessions silent for this many seconds are closed.
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
    /// Maximum requests dispatched at once across all connections.
    pub max_inflight: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], remoting_protocol::DEFAULT_PORT)),
            advertise_host: None,
            idle_timeout_secs: 60,
            max_connections: 1000,
            max_inflight: 256,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parsed("REMOTING_BIND") {
            self.bind_addr = addr;
        }
        if let Some(host) = env_value("REMOTING_ADVERTISE_HOST") {
            self.advertise_host = Some(host);
        }
        if let Some(secs) = env_parsed("REMOTING_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(n) = env_parsed("REMOTING_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
        if let Some(n) = env_parsed("REMOTING_MAX_INFLIGHT") {
            self.max_inflight = n;
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Host published to the registry.
    pub fn advertised_host(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None => self.bind_addr.ip().to_string(),
        }
    }
}

/// Provider publication. Store settings sit flat beside `enabled`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Publish exported services to the registry.
    pub enabled: bool,
    /// Coordination-store session settings.
    #[serde(flatten)]
    pub store: RegistryConfig,
    /// Host a coordination store server for other processes on this address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_listen: Option<SocketAddr>,
}

impl RegistrySettings {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_value("REMOTING_REGISTRY_ENABLED") {
            self.enabled = parse_flag(&flag);
        }
        if let Some(namespace) = env_value("REMOTING_REGISTRY_NAMESPACE") {
            self.store.namespace = namespace;
        }
        // Naming a store implies using it.
        if let Some(connect) = env_value("REMOTING_REGISTRY_CONNECT") {
            self.store.connect_string = connect;
            self.enabled = true;
        }
        if let Some(addr) = env_parsed("REMOTING_REGISTRY_STORE_LISTEN") {
            self.store_listen = Some(addr);
        }
    }
}

/// Prometheus exposition endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_value("REMOTING_METRICS_ENABLED") {
            self.enabled = parse_flag(&flag);
        }
        if let Some(addr) = env_parsed("REMOTING_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// A set, non-empty environment variable.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// An environment variable that parses as `T`; unparsable values are ignored.
fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    env_value(key)?.parse().ok()
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Socket addresses as `"ip:port"` strings.
mod socket_addr_serde {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, out: S) -> Result<S::Ok, S::Error> {
        out.collect_str(addr)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(input: D) -> Result<SocketAddr, D::Error> {
        let text = String::deserialize(input)?;
        text.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 8700);
        assert_eq!(config.network.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.network.advertised_host(), "127.0.0.1");
        assert!(!config.registry.enabled);
        assert_eq!(config.registry.store.namespace, "remoting");
        assert_eq!(config.registry.store.session_timeout_ms, 10_000);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
network:
  bind_addr: "0.0.0.0:9000"
  advertise_host: "10.1.2.3"
registry:
  enabled: true
  namespace: "jremoting"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.advertised_host(), "10.1.2.3");
        assert_eq!(config.network.max_inflight, 256);
        assert!(config.registry.enabled);
        assert_eq!(config.registry.store.namespace, "jremoting");
        assert_eq!(config.registry.store.connect_string, "memory");
        assert_eq!(config.registry.store_listen, None);
    }

    #[test]
    fn test_networked_registry_yaml() {
        let yaml = r#"
registry:
  enabled: true
  connect_string: "10.0.0.5:2190"
  store_listen: "0.0.0.0:2190"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.registry.store.is_in_process());
        assert_eq!(config.registry.store_listen, Some("0.0.0.0:2190".parse().unwrap()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remoting.yaml");

        let mut config = Config::default();
        config.network.max_inflight = 8;
        config.metrics.enabled = true;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.network.max_inflight, 8);
        assert!(loaded.metrics.enabled);
        assert_eq!(loaded.network.bind_addr, config.network.bind_addr);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/remoting.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/remoting.yaml"));
    }

    #[test]
    fn test_env_helpers() {
        std::env::set_var("REMOTING_TEST_ENV_PARSED", "12");
        std::env::set_var("REMOTING_TEST_ENV_GARBAGE", "twelve");
        std::env::set_var("REMOTING_TEST_ENV_EMPTY", "");
        assert_eq!(env_parsed::<u64>("REMOTING_TEST_ENV_PARSED"), Some(12));
        assert_eq!(env_parsed::<u64>("REMOTING_TEST_ENV_GARBAGE"), None);
        assert_eq!(env_value("REMOTING_TEST_ENV_EMPTY"), None);
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("yes"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.network.max_inflight = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.registry.enabled = true;
        config.registry.store.namespace = "a/b".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.registry.enabled = true;
        config.registry.store.connect_string = "zookeeper".to_string();
        assert!(config.validate().is_err());
    }
}
