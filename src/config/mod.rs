//! Configuration management
//!
//! Layered with the `config` crate: built-in defaults, then an optional file,
//! then `TURNKEY__`-prefixed environment variables
//! (`TURNKEY__TURN__PORT=3479`).

use crate::domain::credential::parse_user_pairs;
use crate::domain::shared::TransportProtocol;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config source error: {0}")]
    Source(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub turn: TurnConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub realm: String,
    /// `user=pass` pairs separated by commas or whitespace
    pub users: String,
    /// Address advertised to peers as the relayed address
    pub public_ip: IpAddr,
    pub listen_address: IpAddr,
    pub port: u16,
    pub transport: TransportProtocol,
    /// Local address relay sockets bind to
    pub relay_address: IpAddr,
    pub relay_port_min: u16,
    pub relay_port_max: u16,
    pub default_lifetime_secs: u64,
    pub max_lifetime_secs: u64,
    pub permission_lifetime_secs: u64,
    pub channel_lifetime_secs: u64,
    pub nonce_lifetime_secs: u64,
    pub allocation_sweep_interval_secs: u64,
    pub permission_sweep_interval_secs: u64,
    pub max_allocations: usize,
    pub connect_timeout_secs: u64,
    pub software: Option<String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            realm: "turnkey.local".to_string(),
            users: String::new(),
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3478,
            transport: TransportProtocol::Udp,
            relay_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_port_min: 49152,
            relay_port_max: 65535,
            default_lifetime_secs: 600,
            max_lifetime_secs: 3600,
            permission_lifetime_secs: 300,
            channel_lifetime_secs: 600,
            nonce_lifetime_secs: 3600,
            allocation_sweep_interval_secs: 30,
            permission_sweep_interval_secs: 10,
            max_allocations: 10_000,
            connect_timeout_secs: 30,
            software: Some(concat!("turnkey/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

impl TurnConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn permission_lifetime(&self) -> Duration {
        Duration::from_secs(self.permission_lifetime_secs)
    }

    pub fn channel_lifetime(&self) -> Duration {
        Duration::from_secs(self.channel_lifetime_secs)
    }

    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime_secs)
    }

    pub fn allocation_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.allocation_sweep_interval_secs)
    }

    pub fn permission_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.permission_sweep_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Also write `turnkey.log` (daily rotation) into this directory
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape endpoint; disabled when unset
    pub listen: Option<SocketAddr>,
}

impl Config {
    /// Load defaults, then `path` if given (missing files are an error),
    /// then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("TURNKEY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document layered over the defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ConfigError::Invalid(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let turn = &self.turn;

        if turn.realm.trim().is_empty() {
            return Err(ConfigError::Invalid("realm must not be empty".to_string()));
        }
        if turn.relay_port_min > turn.relay_port_max {
            return Err(ConfigError::Invalid(format!(
                "relay port range {}-{} is inverted",
                turn.relay_port_min, turn.relay_port_max
            )));
        }
        if turn.max_lifetime_secs == 0 {
            return Err(ConfigError::Invalid("max_lifetime_secs must be > 0".to_string()));
        }
        if turn.permission_lifetime_secs == 0 || turn.channel_lifetime_secs == 0 {
            return Err(ConfigError::Invalid(
                "permission and channel lifetimes must be > 0".to_string(),
            ));
        }
        if turn.allocation_sweep_interval_secs == 0 || turn.permission_sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep intervals must be > 0".to_string()));
        }
        if turn.max_allocations == 0 {
            return Err(ConfigError::Invalid("max_allocations must be > 0".to_string()));
        }
        parse_user_pairs(&turn.users).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.turn.port, 3478);
        assert_eq!(config.turn.transport, TransportProtocol::Udp);
        assert_eq!(config.turn.max_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.turn.permission_lifetime(), Duration::from_secs(300));
    }

    #[test]
    fn test_from_toml_str_partial() {
        let config = Config::from_toml_str(
            r#"
            [turn]
            realm = "example.org"
            users = "alice=one bob=two"
            port = 3479
            transport = "tcp"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.turn.realm, "example.org");
        assert_eq!(config.turn.port, 3479);
        assert_eq!(config.turn.transport, TransportProtocol::Tcp);
        assert_eq!(config.turn.relay_port_min, 49152);
        assert_eq!(config.log.level, "debug");
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.turn.relay_port_min = 60000;
        config.turn.relay_port_max = 50000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.turn.realm = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.turn.users = "alice".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.turn.max_lifetime_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[turn]\nrealm = \"file.realm\"\nusers = \"carol=pw\"\npublic_ip = \"192.0.2.10\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.turn.realm, "file.realm");
        assert_eq!(config.turn.public_ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(config.turn.default_lifetime(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load(Some(Path::new("/nonexistent/turnkey.toml"))).is_err());
    }
}
