use std::sync::Arc;

use serde::Serialize;

use crate::cache::CacheController;
use crate::manifest::{CacheManifest, RequestKey};
use crate::network::{FetchRequest, Network, RequestDestination, StoredResponse};

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("no network or cached response available for {key}: {reason}")]
    Unavailable { key: RequestKey, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

impl ResponseSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::OfflineFallback => "offline_fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedResponse {
    pub response: StoredResponse,
    pub source: ResponseSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptorPolicy {
    /// Store successful network responses for asset misses into the active
    /// generation.
    pub cache_on_miss: bool,
}

impl Default for InterceptorPolicy {
    fn default() -> Self {
        Self {
            cache_on_miss: true,
        }
    }
}

/// Chooses exactly one response per request.
///
/// - documents: network first, offline fallback document on transport failure
/// - other GETs: cache first, then network
/// - everything else: network only
pub struct FetchInterceptor {
    cache: Arc<CacheController>,
    network: Arc<dyn Network>,
    policy: InterceptorPolicy,
}

impl FetchInterceptor {
    pub fn new(
        cache: Arc<CacheController>,
        network: Arc<dyn Network>,
        policy: InterceptorPolicy,
    ) -> Self {
        Self {
            cache,
            network,
            policy,
        }
    }

    pub fn policy(&self) -> InterceptorPolicy {
        self.policy
    }

    /// `active` is the manifest of the active generation; `None` before any
    /// activation, in which case no cache is consulted.
    pub async fn intercept(
        &self,
        request: &FetchRequest,
        active: Option<&CacheManifest>,
    ) -> Result<InterceptedResponse, InterceptError> {
        if !request.is_get() {
            return self.network_only(request).await;
        }
        match request.destination() {
            RequestDestination::Document => self.network_first(request, active).await,
            RequestDestination::Other => self.cache_first(request, active).await,
        }
    }

    async fn network_only(
        &self,
        request: &FetchRequest,
    ) -> Result<InterceptedResponse, InterceptError> {
        match self.network.fetch(request).await {
            Ok(response) => Ok(from_network(response)),
            Err(error) => Err(InterceptError::Unavailable {
                key: request.key(),
                reason: error.to_string(),
            }),
        }
    }

    async fn network_first(
        &self,
        request: &FetchRequest,
        active: Option<&CacheManifest>,
    ) -> Result<InterceptedResponse, InterceptError> {
        let error = match self.network.fetch(request).await {
            Ok(response) => return Ok(from_network(response)),
            Err(error) => error,
        };

        let unavailable = |reason: String| InterceptError::Unavailable {
            key: request.key(),
            reason,
        };
        let Some(manifest) = active else {
            return Err(unavailable(error.to_string()));
        };

        let fallback = self
            .cache
            .lookup(manifest.generation(), manifest.offline_fallback())
            .await;
        match fallback {
            Some(response) => {
                tracing::info!(
                    target: "funnels.offline.interceptor",
                    key = %request.key(),
                    generation = %manifest.generation(),
                    error = %error,
                    "network unreachable; serving offline document",
                );
                Ok(InterceptedResponse {
                    response,
                    source: ResponseSource::OfflineFallback,
                })
            }
            None => Err(unavailable(format!(
                "{error}; offline fallback {} not cached",
                manifest.offline_fallback()
            ))),
        }
    }

    async fn cache_first(
        &self,
        request: &FetchRequest,
        active: Option<&CacheManifest>,
    ) -> Result<InterceptedResponse, InterceptError> {
        let key = request.key();
        if let Some(manifest) = active {
            if let Some(response) = self.cache.lookup(manifest.generation(), &key).await {
                return Ok(InterceptedResponse {
                    response,
                    source: ResponseSource::Cache,
                });
            }
        }

        let response = self
            .network
            .fetch(request)
            .await
            .map_err(|error| InterceptError::Unavailable {
                key: key.clone(),
                reason: error.to_string(),
            })?;

        if let Some(manifest) = active {
            if self.should_store(request, &response) {
                self.store_on_miss(manifest, key, &response).await;
            }
        }
        Ok(from_network(response))
    }

    /// Only successful, shareable answers to anonymous requests are kept;
    /// the shell serves every client from one cache.
    fn should_store(&self, request: &FetchRequest, response: &StoredResponse) -> bool {
        self.policy.cache_on_miss
            && response.is_success()
            && !request.carries_credentials()
            && response.is_shareable()
    }

    async fn store_on_miss(
        &self,
        manifest: &CacheManifest,
        key: RequestKey,
        response: &StoredResponse,
    ) {
        let generation = manifest.generation();
        if let Err(error) = self.cache.put(generation, key.clone(), response.clone()).await {
            tracing::debug!(
                target: "funnels.offline.interceptor",
                key = %key,
                generation = %generation,
                error = %error,
                "skipped caching network response",
            );
        }
    }
}

fn from_network(response: StoredResponse) -> InterceptedResponse {
    InterceptedResponse {
        response,
        source: ResponseSource::Network,
    }
}
