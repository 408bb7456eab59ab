//! Layered configuration.
//!
//! Precedence, lowest to highest: compiled defaults, a TOML file,
//! `RPCRETRY_<SECTION>__<KEY>` environment variables, then CLI overrides.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogConfig;
use crate::rpc::client::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT, RetryPolicy};

/// Config file read from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "rpcretry.toml";
pub const ENV_PREFIX: &str = "RPCRETRY_";
pub const DEFAULT_PORT: u16 = 5000;
/// Port used by `simulate_failure`; nothing is expected to listen there.
pub const DEFAULT_FAILURE_PORT: u16 = 9999;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("server.host must be an IP address (got {0:?})")]
    InvalidHost(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: f64,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub failure_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            timeout_secs: DEFAULT_TIMEOUT.as_secs_f64(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs_f64(),
            failure_port: DEFAULT_FAILURE_PORT,
        }
    }
}

impl ClientConfig {
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let timeout = seconds("client.timeout_secs", self.timeout_secs)?;
        if timeout.is_zero() {
            return Err(ConfigError::Zero("client.timeout_secs"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Zero("client.max_retries"));
        }

        Ok(RetryPolicy {
            timeout,
            max_retries: self.max_retries,
            retry_delay: seconds("client.retry_delay_secs", self.retry_delay_secs)?,
        })
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { field, value })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load configuration from every source, with `overrides` (typically
    /// CLI flags) merged last. Unset override fields must be skipped when
    /// serialized so they do not mask lower layers.
    pub fn load<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind_addr()?;
        self.client.retry_policy()?;
        Ok(())
    }
}
