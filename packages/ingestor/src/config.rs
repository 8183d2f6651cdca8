//! Subscription Configuration
//!
//! Which account to watch, where the network config comes from, the size of the
//! transaction queue and the restart backoff. Values can be read from
//! `TONWATCH_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::address::MsgAddress;

/// Public mainnet network config
pub const DEFAULT_NETWORK_CONFIG: &str = "https://ton.org/global.config.json";

/// Capacity of the queue between the feed and the consumer
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Initial delay before restarting the consumer or the feed
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum restart delay
pub const MAX_BACKOFF_MS: u64 = 30000;

pub const ENV_ADDRESS: &str = "TONWATCH_ADDRESS";
pub const ENV_NETWORK_CONFIG: &str = "TONWATCH_NETWORK_CONFIG";
pub const ENV_QUEUE_CAPACITY: &str = "TONWATCH_QUEUE_CAPACITY";
pub const ENV_RESTART_BACKOFF_MS: &str = "TONWATCH_RESTART_BACKOFF_MS";
pub const ENV_MAX_RESTART_BACKOFF_MS: &str = "TONWATCH_MAX_RESTART_BACKOFF_MS";

/// Errors in the subscription configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid account address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("No account address configured")]
    MissingAddress,

    #[error("Invalid network config source: {0}")]
    InvalidNetworkConfig(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Queue capacity must be at least 1")]
    ZeroQueueCapacity,

    #[error("Initial backoff {initial_ms}ms exceeds the maximum {max_ms}ms")]
    BackoffExceedsMax { initial_ms: u64, max_ms: u64 },
}

/// Location of the network config
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkConfigSource {
    Url(String),
    File(PathBuf),
}

impl NetworkConfigSource {
    /// Parse a source string: `http(s)://` is a URL, anything else a file path (`~/` expanded)
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(ConfigError::InvalidNetworkConfig("source cannot be empty".to_string()));
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(NetworkConfigSource::Url(source.to_string()));
        }
        Ok(NetworkConfigSource::File(PathBuf::from(expand_path(source))))
    }
}

/// Configuration of a single-account subscription
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Observed account, raw or user-friendly form
    pub address: String,
    /// Network config URL or file path
    pub network_config: String,
    /// Capacity of the transaction queue
    pub queue_capacity: usize,
    /// Initial restart backoff in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum restart backoff in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            network_config: DEFAULT_NETWORK_CONFIG.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl SubscriptionConfig {
    /// Create a new config watching the specified account
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Calculate backoff delay for a given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms.saturating_mul(1u64 << attempt.min(10));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }

    /// Check the config and parse the observed address
    pub fn validate(&self) -> Result<MsgAddress, ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::BackoffExceedsMax {
                initial_ms: self.initial_backoff_ms,
                max_ms: self.max_backoff_ms,
            });
        }
        self.network_source()?;
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        let address: MsgAddress = self.address.parse().map_err(|e: crate::cell::DecodeError| {
            ConfigError::InvalidAddress {
                address: self.address.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(address)
    }

    pub fn network_source(&self) -> Result<NetworkConfigSource, ConfigError> {
        NetworkConfigSource::parse(&self.network_config)
    }

    /// Read the config from `TONWATCH_*` environment variables, with defaults for unset values
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the config through `lookup`, keyed by environment variable name
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(address) = lookup(ENV_ADDRESS) {
            config.address = address;
        }
        if let Some(network_config) = lookup(ENV_NETWORK_CONFIG) {
            config.network_config = network_config;
        }
        if let Some(value) = lookup(ENV_QUEUE_CAPACITY) {
            config.queue_capacity = parse_number(ENV_QUEUE_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_RESTART_BACKOFF_MS) {
            config.initial_backoff_ms = parse_number(ENV_RESTART_BACKOFF_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_RESTART_BACKOFF_MS) {
            config.max_backoff_ms = parse_number(ENV_MAX_RESTART_BACKOFF_MS, &value)?;
        }
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
