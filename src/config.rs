use crate::aggregator::AggregatorConfig;
use crate::connection::ReconnectPolicy;
use crate::scheduler::SchedulerConfig;
use std::env;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8765";

pub const ENV_URL: &str = "SIGN_STREAM_URL";
pub const ENV_MAX_FRAME_KB: &str = "SIGN_STREAM_MAX_FRAME_KB";
pub const ENV_MAX_RECONNECTS: &str = "SIGN_STREAM_MAX_RECONNECTS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: String, value: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

/// Everything a streaming session needs to know
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Url,
    pub reconnect: ReconnectPolicy,
    pub scheduler: SchedulerConfig,
    pub aggregator: AggregatorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL"),
            reconnect: ReconnectPolicy::default(),
            scheduler: SchedulerConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by the environment (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Some(url) = read_var(ENV_URL)? {
            config.endpoint = parse_endpoint(&url)?;
        }
        if let Some(kb) = read_var(ENV_MAX_FRAME_KB)? {
            config.scheduler.max_frame_kb = parse_number(ENV_MAX_FRAME_KB, &kb)?;
        }
        if let Some(max) = read_var(ENV_MAX_RECONNECTS)? {
            config.reconnect.max_attempts = parse_number(ENV_MAX_RECONNECTS, &max)?;
        }
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, ConfigError> {
        self.endpoint = parse_endpoint(endpoint)?;
        Ok(self)
    }
}

/// Only `ws://` and `wss://` endpoints are accepted
pub fn parse_endpoint(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|e| ConfigError::InvalidEndpoint {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidEndpoint {
            value: value.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn read_var(name: &str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_number<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    })
}
