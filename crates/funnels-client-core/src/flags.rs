use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tokens::{TokenPair, TokenStore, TokenStoreError};

pub const DEFAULT_SERVICE_PORT: u16 = 8000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlagsError {
    #[error("page scheme must be http or https, got '{0}'")]
    UnsupportedScheme(String),
    #[error("page host must not be empty")]
    EmptyHost,
}

/// Initial state handed to the UI program once, at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupFlags {
    pub base_url: String,
    pub tokens: Option<TokenPair>,
    pub dashboard: Value,
    pub login: Value,
}

impl StartupFlags {
    pub fn new(base_url: impl Into<String>, tokens: Option<TokenPair>) -> Self {
        Self {
            base_url: base_url.into(),
            tokens,
            dashboard: Value::Object(Map::new()),
            login: Value::Object(Map::new()),
        }
    }

    pub fn from_store(
        store: &TokenStore,
        base_url: impl Into<String>,
    ) -> Result<Self, TokenStoreError> {
        Ok(Self::new(base_url, store.read()?))
    }
}

/// Service URL for the page: same scheme and hostname, fixed service port.
///
/// `scheme` may carry the trailing colon browsers report (`"https:"`), and
/// `host` may carry a port, which is dropped.
pub fn derive_base_url(scheme: &str, host: &str, service_port: u16) -> Result<String, FlagsError> {
    let scheme = scheme.trim().trim_end_matches(':').to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(FlagsError::UnsupportedScheme(scheme));
    }

    let hostname = strip_port(host.trim());
    if hostname.is_empty() {
        return Err(FlagsError::EmptyHost);
    }

    Ok(format!("{scheme}://{hostname}:{service_port}"))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|ch| ch.is_ascii_digit()) => name,
        _ => host,
    }
}
