use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use funnels_client_core::DEFAULT_SERVICE_PORT;
use funnels_offline::{CacheGeneration, ManifestError};
use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:5173";
const DEFAULT_CACHE_ON_MISS: bool = true;

pub const ENV_BIND_ADDR: &str = "FUNNELS_SHELL_BIND_ADDR";
pub const ENV_LOG_FILTER: &str = "FUNNELS_SHELL_LOG_FILTER";
pub const ENV_LOG_JSON: &str = "FUNNELS_SHELL_LOG_JSON";
pub const ENV_UPSTREAM_URL: &str = "FUNNELS_SHELL_UPSTREAM_URL";
pub const ENV_UPSTREAM_TIMEOUT_MS: &str = "FUNNELS_SHELL_UPSTREAM_TIMEOUT_MS";
pub const ENV_CACHE_DIR: &str = "FUNNELS_SHELL_CACHE_DIR";
pub const ENV_CACHE_VERSION: &str = "FUNNELS_SHELL_CACHE_VERSION";
pub const ENV_CACHE_ON_MISS: &str = "FUNNELS_SHELL_CACHE_ON_MISS";
pub const ENV_TOKEN_STORE_PATH: &str = "FUNNELS_SHELL_TOKEN_STORE_PATH";
pub const ENV_SERVICE_PORT: &str = "FUNNELS_SHELL_SERVICE_PORT";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub upstream_url: String,
    pub upstream_timeout: Option<Duration>,
    /// `None` keeps the asset cache in memory.
    pub cache_dir: Option<PathBuf>,
    pub cache_version: CacheGeneration,
    pub cache_on_miss: bool,
    /// `None` keeps session tokens in memory.
    pub token_store_path: Option<PathBuf>,
    pub service_port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid FUNNELS_SHELL_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid FUNNELS_SHELL_UPSTREAM_URL value '{0}': expected an http(s) origin")]
    InvalidUpstreamUrl(String),
    #[error("invalid FUNNELS_SHELL_UPSTREAM_TIMEOUT_MS value '{0}'")]
    InvalidUpstreamTimeout(String),
    #[error("invalid FUNNELS_SHELL_CACHE_VERSION: {0}")]
    InvalidCacheVersion(#[from] ManifestError),
    #[error("invalid FUNNELS_SHELL_SERVICE_PORT value '{0}'")]
    InvalidServicePort(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = non_empty_var(ENV_BIND_ADDR)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter =
            non_empty_var(ENV_LOG_FILTER).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let log_json = env::var(ENV_LOG_JSON)
            .ok()
            .is_some_and(|value| parse_flag(&value));

        let upstream_url = non_empty_var(ENV_UPSTREAM_URL)
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !upstream_url.starts_with("http://") && !upstream_url.starts_with("https://") {
            return Err(ConfigError::InvalidUpstreamUrl(upstream_url));
        }

        let upstream_timeout = non_empty_var(ENV_UPSTREAM_TIMEOUT_MS)
            .map(|value| {
                value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|millis| *millis > 0)
                    .map(Duration::from_millis)
                    .ok_or(ConfigError::InvalidUpstreamTimeout(value))
            })
            .transpose()?;

        let cache_dir = non_empty_var(ENV_CACHE_DIR).map(PathBuf::from);

        let cache_version = match non_empty_var(ENV_CACHE_VERSION) {
            Some(value) => CacheGeneration::new(value.trim())?,
            None => CacheGeneration::default(),
        };

        let cache_on_miss = env::var(ENV_CACHE_ON_MISS)
            .ok()
            .map(|value| parse_flag(&value))
            .unwrap_or(DEFAULT_CACHE_ON_MISS);

        let token_store_path = non_empty_var(ENV_TOKEN_STORE_PATH).map(PathBuf::from);

        let service_port = non_empty_var(ENV_SERVICE_PORT)
            .map(|value| {
                value
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port > 0)
                    .ok_or(ConfigError::InvalidServicePort(value))
            })
            .transpose()?
            .unwrap_or(DEFAULT_SERVICE_PORT);

        Ok(Self {
            bind_addr,
            log_filter,
            log_json,
            upstream_url,
            upstream_timeout,
            cache_dir,
            cache_version,
            cache_on_miss,
            token_store_path,
            service_port,
        })
    }

    pub fn for_tests(upstream_url: impl Into<String>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_json: false,
            upstream_url: upstream_url.into(),
            upstream_timeout: Some(Duration::from_secs(5)),
            cache_dir: None,
            cache_version: CacheGeneration::default(),
            cache_on_miss: DEFAULT_CACHE_ON_MISS,
            token_store_path: None,
            service_port: DEFAULT_SERVICE_PORT,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}
