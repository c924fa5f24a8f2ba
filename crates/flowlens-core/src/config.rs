//! Client configuration.
//!
//! Values are layered in this order, later sources winning:
//!
//! 1. Built-in defaults
//! 2. An optional JSON file (`ClientConfig::from_file`)
//! 3. Environment variables (`ClientConfig::apply_env`)
//!
//! # Environment Variables
//!
//! | Setting | Primary Env Var | Fallback Env Var |
//! |---------|-----------------|------------------|
//! | Base URL | `FLOWLENS_API_BASE_URL` | `UW_API_BASE_URL` |
//! | Timeout (s) | `FLOWLENS_API_TIMEOUT` | `UW_API_TIMEOUT` |
//! | Requests per second | `FLOWLENS_API_RATE_LIMIT` | `UW_API_RATE_LIMIT` |
//! | Default cache TTL (s) | `FLOWLENS_CACHE_TTL` | - |

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://api.unusualwhales.com";

/// Upstream API connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Outbound budget shared by every caller. Zero or negative disables throttling.
    pub rate_limit_per_second: f64,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            timeout_secs: 30,
            rate_limit_per_second: 10.0,
            user_agent: format!("flowlens/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub max_entries: Option<usize>,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            max_entries: None,
            cleanup_interval_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Batch orchestration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrent: usize,
    /// Upper bound on tickers refreshed by one watchlist refresh.
    pub refresh_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            refresh_limit: 5,
        }
    }
}

/// Full client configuration, read once when the client is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
}

impl ClientConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file and then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_lookup(|name| env::var(name).ok())
    }

    fn apply_lookup<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some((_, value)) = first_set(&lookup, &["FLOWLENS_API_BASE_URL", "UW_API_BASE_URL"]) {
            self.api.base_url = value;
        }
        if let Some((name, value)) = first_set(&lookup, &["FLOWLENS_API_TIMEOUT", "UW_API_TIMEOUT"]) {
            self.api.timeout_secs = parse_env(name, &value)?;
        }
        if let Some((name, value)) =
            first_set(&lookup, &["FLOWLENS_API_RATE_LIMIT", "UW_API_RATE_LIMIT"])
        {
            self.api.rate_limit_per_second = parse_env(name, &value)?;
        }
        if let Some((name, value)) = first_set(&lookup, &["FLOWLENS_CACHE_TTL"]) {
            self.cache.default_ttl_secs = parse_env(name, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(String::from("api base_url must not be empty")));
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from("api timeout must be positive")));
        }
        if !self.api.rate_limit_per_second.is_finite() {
            return Err(ConfigError::Invalid(String::from("api rate limit must be finite")));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid(String::from("cache TTL must be positive")));
        }
        if self.cache.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "cache cleanup interval must be positive",
            )));
        }
        if self.batch.max_concurrent == 0 {
            return Err(ConfigError::Invalid(String::from(
                "batch max_concurrent must be positive",
            )));
        }
        Ok(())
    }
}

fn first_set<F>(lookup: &F, names: &[&'static str]) -> Option<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    names.iter().find_map(|name| {
        lookup(name)
            .filter(|value| !value.trim().is_empty())
            .map(|value| (*name, value))
    })
}

fn parse_env<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_owned(),
    })
}
