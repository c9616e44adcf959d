//! Proxy configuration: TOML file, defaults and command-line overrides.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::db;
use crate::error::ProxyError;
use crate::forwarder::DEFAULT_UPSTREAM_PORT;
use crate::proxy::ProxyConfig;
use crate::rating::UpstreamSeed;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "rankdns.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Socket timeout for upstream exchanges and client replies.
    pub timeout_secs: f64,
    pub poll_interval_secs: f64,
    pub max_in_flight: Option<usize>,
    /// Zero disables the periodic stats line.
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 53,
            timeout_secs: 5.0,
            poll_interval_secs: 15.0,
            max_in_flight: None,
            stats_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file; `:memory:` keeps everything in memory.
    pub path: String,
    /// Regular expressions for addresses that are never cached.
    pub skip_ip_patterns: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "rankdns.sqlite".to_string(),
            skip_ip_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Port for servers listed without one.
    pub port: u16,
    /// Seeds an empty rating table; the built-in list is used when empty.
    pub servers: Vec<UpstreamSeed>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_UPSTREAM_PORT,
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Command-line overrides for configuration
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub timeout_secs: Option<f64>,
    pub database_path: Option<String>,
    pub skip_ip_patterns: Option<Vec<String>>,
    pub max_in_flight: Option<usize>,
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from file or use defaults
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. rankdns.toml in current directory
    /// 3. Default configuration
    pub fn load(path: Option<&str>, cli_overrides: CliOverrides) -> Result<Self, ProxyError> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Self::default()
        };

        config.apply_cli_overrides(cli_overrides);
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("cannot read {}: {}", path, e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ProxyError> {
        toml::from_str(contents).map_err(|e| ProxyError::Config(e.to_string()))
    }

    fn apply_cli_overrides(&mut self, overrides: CliOverrides) {
        if let Some(bind) = overrides.bind_address {
            self.server.bind_address = bind;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(timeout) = overrides.timeout_secs {
            self.server.timeout_secs = timeout;
        }
        if let Some(path) = overrides.database_path {
            self.storage.path = path;
        }
        if let Some(patterns) = overrides.skip_ip_patterns {
            self.storage.skip_ip_patterns = patterns;
        }
        if overrides.max_in_flight.is_some() {
            self.server.max_in_flight = overrides.max_in_flight;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    /// Validate and convert into the runtime configuration.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ProxyError> {
        let ip: IpAddr = self.server.bind_address.parse().map_err(|_| {
            ProxyError::Config(format!("invalid bind address {:?}", self.server.bind_address))
        })?;

        let database_url = if self.storage.path == ":memory:" {
            "sqlite::memory:".to_string()
        } else if self.storage.path.is_empty() {
            return Err(ProxyError::Config("storage path cannot be empty".to_string()));
        } else {
            db::file_url(&self.storage.path)
        };

        Ok(ProxyConfig {
            bind_addr: SocketAddr::new(ip, self.server.port),
            database_url,
            timeout: positive_secs("server.timeout_secs", self.server.timeout_secs)?,
            poll_interval: positive_secs("server.poll_interval_secs", self.server.poll_interval_secs)?,
            upstream_port: self.upstream.port,
            upstreams: self.upstream.servers.clone(),
            exclude_patterns: self.storage.skip_ip_patterns.clone(),
            max_in_flight: self.server.max_in_flight,
            stats_interval: Duration::from_secs(self.server.stats_interval_secs),
        })
    }
}

fn positive_secs(field: &str, secs: f64) -> Result<Duration, ProxyError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(ProxyError::Config(format!(
            "{} must be a positive number of seconds, got {}",
            field, secs
        ))),
    }
}
