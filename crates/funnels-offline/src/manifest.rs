use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CACHE_VERSION: &str = "pwa-assets-v1";
pub const OFFLINE_FALLBACK_PATH: &str = "/offline.html";
pub const SHELL_ASSET_PATHS: [&str; 4] = [
    "/index.html",
    OFFLINE_FALLBACK_PATH,
    "/css/offline.css",
    "/manifest.json",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("cache generation tag '{0}' must be non-empty and use only [A-Za-z0-9._-]")]
    InvalidGeneration(String),
    #[error("offline fallback {0} is not part of the manifest")]
    FallbackNotListed(RequestKey),
    #[error("manifest must list at least one entry")]
    Empty,
}

/// Normalized method plus request target, e.g. `GET /css/offline.css`.
///
/// Targets are origin-relative: scheme and authority of absolute URLs are
/// dropped, as is any fragment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(method: &str, target: &str) -> Self {
        let method = method.trim().to_ascii_uppercase();
        Self(format!("{method} {}", normalize_target(target)))
    }

    pub fn get(target: &str) -> Self {
        Self::new("GET", target)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn method(&self) -> &str {
        self.0.split_once(' ').map_or("", |(method, _)| method)
    }

    pub fn target(&self) -> &str {
        self.0.split_once(' ').map_or("/", |(_, target)| target)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_target(target: &str) -> String {
    let target = target.trim();
    let target = target.split_once('#').map_or(target, |(head, _)| head);

    let relative = ["http://", "https://"]
        .iter()
        .find_map(|scheme| target.strip_prefix(scheme))
        .map_or(target, |rest| rest.find('/').map_or("", |slash| &rest[slash..]));

    if relative.is_empty() {
        "/".to_string()
    } else if relative.starts_with('/') {
        relative.to_string()
    } else {
        format!("/{relative}")
    }
}

/// Version tag of one cache generation. Also used as a directory name by the
/// disk cache, hence the restricted alphabet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheGeneration(String);

impl CacheGeneration {
    pub fn new(tag: impl Into<String>) -> Result<Self, ManifestError> {
        let tag = tag.into();
        let valid = !tag.is_empty()
            && !tag.starts_with('.')
            && tag
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
        if valid {
            Ok(Self(tag))
        } else {
            Err(ManifestError::InvalidGeneration(tag))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CacheGeneration {
    fn default() -> Self {
        Self(DEFAULT_CACHE_VERSION.to_string())
    }
}

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheGeneration {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CacheGeneration> for String {
    fn from(value: CacheGeneration) -> Self {
        value.0
    }
}

/// Ordered set of request keys installed together as one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheManifest {
    generation: CacheGeneration,
    entries: Vec<RequestKey>,
    offline_fallback: RequestKey,
}

impl CacheManifest {
    /// Duplicate entries keep their first position.
    pub fn new(
        generation: CacheGeneration,
        entries: impl IntoIterator<Item = RequestKey>,
        offline_fallback: RequestKey,
    ) -> Result<Self, ManifestError> {
        let mut seen = BTreeSet::new();
        let entries: Vec<RequestKey> = entries
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();

        if entries.is_empty() {
            return Err(ManifestError::Empty);
        }
        if !seen.contains(&offline_fallback) {
            return Err(ManifestError::FallbackNotListed(offline_fallback));
        }

        Ok(Self {
            generation,
            entries,
            offline_fallback,
        })
    }

    /// Shell document, offline document, its stylesheet and the app
    /// manifest descriptor.
    pub fn default_shell(generation: CacheGeneration) -> Self {
        Self {
            generation,
            entries: SHELL_ASSET_PATHS
                .iter()
                .map(|path| RequestKey::get(path))
                .collect(),
            offline_fallback: RequestKey::get(OFFLINE_FALLBACK_PATH),
        }
    }

    pub fn generation(&self) -> &CacheGeneration {
        &self.generation
    }

    pub fn entries(&self) -> &[RequestKey] {
        &self.entries
    }

    pub fn offline_fallback(&self) -> &RequestKey {
        &self.offline_fallback
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains(key)
    }
}
