use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::manifest::{CacheGeneration, CacheManifest, RequestKey};
use crate::network::{FetchRequest, Network, StoredResponse};
use crate::store::CacheStorage;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cannot warm generation {generation} while it is {}", from.as_str())]
    InvalidTransition {
        generation: CacheGeneration,
        from: GenerationState,
    },
    #[error("warming generation {generation} failed at {key}: {reason}")]
    WarmFailed {
        generation: CacheGeneration,
        key: RequestKey,
        reason: String,
    },
    #[error("cache generation {0} is not ready")]
    NotReady(CacheGeneration),
    #[error("cache io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cache index {path} is invalid: {source}")]
    Index {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Uninitialized,
    Warming,
    Ready,
    Stale,
}

impl GenerationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Warming => "warming",
            Self::Ready => "ready",
            Self::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub generation: CacheGeneration,
    pub entries: usize,
    pub bytes: usize,
}

/// Owns the lifecycle of cache generations on top of a [`CacheStorage`].
///
/// Lookups only ever see generations in the `Ready` state.
pub struct CacheController {
    storage: Arc<dyn CacheStorage>,
    states: Mutex<BTreeMap<CacheGeneration, GenerationState>>,
}

impl CacheController {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            storage,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn state(&self, generation: &CacheGeneration) -> GenerationState {
        self.lock_states()
            .get(generation)
            .copied()
            .unwrap_or(GenerationState::Uninitialized)
    }

    /// Marks generations already committed in storage as `Ready`, e.g. after a
    /// restart against a disk cache. Leftovers of interrupted commits are
    /// discarded first.
    pub async fn restore(&self) -> Result<Vec<CacheGeneration>, CacheError> {
        let discarded = self.storage.discard_incomplete().await?;
        if discarded > 0 {
            tracing::info!(
                target: "funnels.offline.cache",
                discarded,
                "discarded incomplete cache commits",
            );
        }

        let committed = self.storage.generations().await?;
        let mut states = self.lock_states();
        for generation in &committed {
            let state = states
                .entry(generation.clone())
                .or_insert(GenerationState::Uninitialized);
            if *state == GenerationState::Uninitialized {
                *state = GenerationState::Ready;
            }
        }
        drop(states);

        if !committed.is_empty() {
            tracing::info!(
                target: "funnels.offline.cache",
                generations = ?committed.iter().map(CacheGeneration::as_str).collect::<Vec<_>>(),
                "restored committed cache generations",
            );
        }
        Ok(committed)
    }

    /// Fetches every manifest entry and commits them as one generation.
    /// Only `Uninitialized` and `Stale` generations can be warmed, so an
    /// evicted tag can be brought back, e.g. for a rollback.
    ///
    /// Any transport failure or non-2xx response aborts the warm and leaves
    /// the generation `Uninitialized` with nothing observable.
    pub async fn warm(
        &self,
        manifest: &CacheManifest,
        network: &dyn Network,
    ) -> Result<WarmReport, CacheError> {
        let generation = manifest.generation().clone();
        self.begin_warm(&generation)?;

        match self.fetch_and_commit(manifest, network).await {
            Ok(report) => {
                self.set_state(&generation, GenerationState::Ready);
                tracing::info!(
                    target: "funnels.offline.cache",
                    generation = %generation,
                    entries = report.entries,
                    bytes = report.bytes,
                    "cache generation ready",
                );
                Ok(report)
            }
            Err(error) => {
                self.set_state(&generation, GenerationState::Uninitialized);
                tracing::warn!(
                    target: "funnels.offline.cache",
                    generation = %generation,
                    error = %error,
                    "cache warm failed",
                );
                Err(error)
            }
        }
    }

    /// Stale, unknown and still-warming generations always miss. Storage
    /// failures are logged and reported as a miss.
    pub async fn lookup(
        &self,
        generation: &CacheGeneration,
        key: &RequestKey,
    ) -> Option<StoredResponse> {
        if self.state(generation) != GenerationState::Ready {
            return None;
        }
        match self.storage.get(generation, key).await {
            Ok(hit) => hit,
            Err(error) => {
                tracing::warn!(
                    target: "funnels.offline.cache",
                    generation = %generation,
                    key = %key,
                    error = %error,
                    "cache lookup failed; treating as miss",
                );
                None
            }
        }
    }

    /// Adds one entry to a `Ready` generation. `Set-Cookie` headers are never
    /// persisted.
    pub async fn put(
        &self,
        generation: &CacheGeneration,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        if self.state(generation) != GenerationState::Ready {
            return Err(CacheError::NotReady(generation.clone()));
        }
        self.storage
            .put(generation, key, response.for_storage())
            .await
    }

    /// Deletes every generation other than `current` and returns the ones
    /// removed.
    pub async fn evict_stale(
        &self,
        current: &CacheGeneration,
    ) -> Result<Vec<CacheGeneration>, CacheError> {
        let mut candidates = self.storage.generations().await?;
        candidates.extend(
            self.lock_states()
                .iter()
                .filter(|(_, state)| **state == GenerationState::Ready)
                .map(|(generation, _)| generation.clone()),
        );
        candidates.sort();
        candidates.dedup();
        candidates.retain(|generation| generation != current);

        for generation in &candidates {
            // Marked first so no lookup can hit a half-deleted generation.
            self.set_state(generation, GenerationState::Stale);
            self.storage.delete_generation(generation).await?;
            tracing::info!(
                target: "funnels.offline.cache",
                generation = %generation,
                current = %current,
                "evicted stale cache generation",
            );
        }
        Ok(candidates)
    }

    fn begin_warm(&self, generation: &CacheGeneration) -> Result<(), CacheError> {
        let mut states = self.lock_states();
        let state = states
            .entry(generation.clone())
            .or_insert(GenerationState::Uninitialized);
        if !matches!(
            *state,
            GenerationState::Uninitialized | GenerationState::Stale
        ) {
            return Err(CacheError::InvalidTransition {
                generation: generation.clone(),
                from: *state,
            });
        }
        *state = GenerationState::Warming;
        Ok(())
    }

    async fn fetch_and_commit(
        &self,
        manifest: &CacheManifest,
        network: &dyn Network,
    ) -> Result<WarmReport, CacheError> {
        let generation = manifest.generation();
        let mut buffered = Vec::with_capacity(manifest.entries().len());
        let mut bytes = 0;

        for key in manifest.entries() {
            let request = FetchRequest::new(key.method(), key.target());
            let warm_failed = |reason: String| CacheError::WarmFailed {
                generation: generation.clone(),
                key: key.clone(),
                reason,
            };

            let response = network
                .fetch(&request)
                .await
                .map_err(|error| warm_failed(error.to_string()))?;
            if !response.is_success() {
                return Err(warm_failed(format!("status {}", response.status)));
            }

            bytes += response.body.len();
            buffered.push((key.clone(), response.for_storage()));
        }

        let entries = buffered.len();
        self.storage.commit_generation(generation, buffered).await?;
        Ok(WarmReport {
            generation: generation.clone(),
            entries,
            bytes,
        })
    }

    fn set_state(&self, generation: &CacheGeneration, state: GenerationState) {
        self.lock_states().insert(generation.clone(), state);
    }

    fn lock_states(&self) -> MutexGuard<'_, BTreeMap<CacheGeneration, GenerationState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("states", &*self.lock_states())
            .finish_non_exhaustive()
    }
}
