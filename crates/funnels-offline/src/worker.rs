use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::cache::{CacheController, CacheError, GenerationState, WarmReport};
use crate::interceptor::{FetchInterceptor, InterceptError, InterceptedResponse, InterceptorPolicy};
use crate::manifest::{CacheGeneration, CacheManifest};
use crate::network::{FetchRequest, Network};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is busy {}", .0.as_str())]
    Busy(WorkerPhase),
    #[error("no installed generation to activate")]
    NothingInstalled,
    #[error("generation {0} is not cached")]
    NotCached(CacheGeneration),
    #[error("generation {0} is already active")]
    AlreadyActive(CacheGeneration),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Installing,
    Installed,
    Activating,
    Active,
}

impl WorkerPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
        }
    }

    fn is_transitioning(self) -> bool {
        matches!(self, Self::Installing | Self::Activating)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
    Warmed(WarmReport),
    /// The generation was already committed, e.g. restored from disk.
    AlreadyCached { generation: CacheGeneration },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    pub active_generation: Option<CacheGeneration>,
    pub installed_generation: Option<CacheGeneration>,
}

struct Lifecycle {
    phase: WorkerPhase,
    installed: Option<Arc<CacheManifest>>,
}

/// Install, activate and fetch events for the offline proxy.
///
/// Fetches snapshot the active manifest when they start. Activation swaps
/// the active manifest and evicts stale generations under the write lock, so
/// fetches that start meanwhile wait for it while those already running keep
/// their snapshot.
pub struct OfflineWorker {
    cache: Arc<CacheController>,
    network: Arc<dyn Network>,
    interceptor: FetchInterceptor,
    lifecycle: Mutex<Lifecycle>,
    active: RwLock<Option<Arc<CacheManifest>>>,
}

impl OfflineWorker {
    pub fn new(
        cache: Arc<CacheController>,
        network: Arc<dyn Network>,
        policy: InterceptorPolicy,
    ) -> Self {
        let interceptor = FetchInterceptor::new(Arc::clone(&cache), Arc::clone(&network), policy);
        Self {
            cache,
            network,
            interceptor,
            lifecycle: Mutex::new(Lifecycle {
                phase: WorkerPhase::Idle,
                installed: None,
            }),
            active: RwLock::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<CacheController> {
        &self.cache
    }

    pub fn phase(&self) -> WorkerPhase {
        self.lock_lifecycle().phase
    }

    pub async fn status(&self) -> WorkerStatus {
        let active_generation = self
            .active
            .read()
            .await
            .as_ref()
            .map(|manifest| manifest.generation().clone());
        let lifecycle = self.lock_lifecycle();
        WorkerStatus {
            phase: lifecycle.phase,
            active_generation,
            installed_generation: lifecycle
                .installed
                .as_ref()
                .map(|manifest| manifest.generation().clone()),
        }
    }

    /// Warms `manifest` into its own generation. On failure the worker
    /// returns to its previous phase and any active generation keeps serving.
    pub async fn install(&self, manifest: CacheManifest) -> Result<InstallOutcome, WorkerError> {
        let previous = self.enter(WorkerPhase::Installing)?;
        let generation = manifest.generation().clone();

        let outcome = if self.cache.state(&generation) == GenerationState::Ready {
            Ok(InstallOutcome::AlreadyCached {
                generation: generation.clone(),
            })
        } else {
            self.cache
                .warm(&manifest, self.network.as_ref())
                .await
                .map(InstallOutcome::Warmed)
        };

        let mut lifecycle = self.lock_lifecycle();
        match outcome {
            Ok(outcome) => {
                lifecycle.phase = WorkerPhase::Installed;
                lifecycle.installed = Some(Arc::new(manifest));
                tracing::info!(
                    target: "funnels.offline.worker",
                    generation = %generation,
                    "worker installed",
                );
                Ok(outcome)
            }
            Err(error) => {
                lifecycle.phase = previous;
                tracing::warn!(
                    target: "funnels.offline.worker",
                    generation = %generation,
                    phase = previous.as_str(),
                    error = %error,
                    "worker install failed; keeping previous generation",
                );
                Err(error.into())
            }
        }
    }

    /// Makes the installed generation active and evicts every other one.
    pub async fn activate(&self) -> Result<Vec<CacheGeneration>, WorkerError> {
        let manifest = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.phase.is_transitioning() {
                return Err(WorkerError::Busy(lifecycle.phase));
            }
            let Some(manifest) = lifecycle.installed.clone() else {
                return Err(WorkerError::NothingInstalled);
            };
            lifecycle.phase = WorkerPhase::Activating;
            manifest
        };
        let generation = manifest.generation().clone();

        let mut active = self.active.write().await;
        let evicted = match self.cache.evict_stale(&generation).await {
            Ok(evicted) => evicted,
            Err(error) => {
                drop(active);
                self.lock_lifecycle().phase = WorkerPhase::Installed;
                return Err(error.into());
            }
        };
        *active = Some(manifest);
        drop(active);

        let mut lifecycle = self.lock_lifecycle();
        lifecycle.phase = WorkerPhase::Active;
        lifecycle.installed = None;
        tracing::info!(
            target: "funnels.offline.worker",
            generation = %generation,
            evicted = evicted.len(),
            "worker activated",
        );
        Ok(evicted)
    }

    /// Serves an already committed generation, e.g. one restored from disk,
    /// when nothing is active yet. Nothing is warmed or evicted, so a later
    /// install and activate still replaces it.
    pub async fn adopt(&self, manifest: CacheManifest) -> Result<(), WorkerError> {
        let generation = manifest.generation().clone();
        if self.cache.state(&generation) != GenerationState::Ready {
            return Err(WorkerError::NotCached(generation));
        }
        let previous = self.enter(WorkerPhase::Activating)?;

        let mut active = self.active.write().await;
        if let Some(current) = active.as_ref() {
            let current = current.generation().clone();
            drop(active);
            self.lock_lifecycle().phase = previous;
            return Err(WorkerError::AlreadyActive(current));
        }
        *active = Some(Arc::new(manifest));
        drop(active);

        self.lock_lifecycle().phase = WorkerPhase::Active;
        tracing::info!(
            target: "funnels.offline.worker",
            generation = %generation,
            "worker adopted cached generation",
        );
        Ok(())
    }

    pub async fn fetch(
        &self,
        request: &FetchRequest,
    ) -> Result<InterceptedResponse, InterceptError> {
        let snapshot = self.active.read().await.clone();
        self.interceptor.intercept(request, snapshot.as_deref()).await
    }

    fn enter(&self, next: WorkerPhase) -> Result<WorkerPhase, WorkerError> {
        let mut lifecycle = self.lock_lifecycle();
        let previous = lifecycle.phase;
        if previous.is_transitioning() {
            return Err(WorkerError::Busy(previous));
        }
        lifecycle.phase = next;
        Ok(previous)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::interceptor::ResponseSource;
    use crate::manifest::RequestKey;
    use crate::network::fake::FakeNetwork;
    use crate::store::MemoryCacheStorage;

    fn manifest(tag: &str) -> CacheManifest {
        CacheManifest::default_shell(CacheGeneration::new(tag).expect("generation"))
    }

    fn worker(network: &Arc<FakeNetwork>) -> (OfflineWorker, Arc<CacheController>) {
        let cache = Arc::new(CacheController::new(Arc::new(MemoryCacheStorage::new())));
        let worker = OfflineWorker::new(
            Arc::clone(&cache),
            network.clone(),
            InterceptorPolicy::default(),
        );
        (worker, cache)
    }

    #[tokio::test]
    async fn lifecycle_moves_from_idle_to_active() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, _) = worker(&network);
        assert_eq!(worker.phase(), WorkerPhase::Idle);

        let outcome = worker.install(manifest("v1")).await.expect("install");
        assert!(matches!(outcome, InstallOutcome::Warmed(ref report) if report.entries == 4));
        assert_eq!(worker.phase(), WorkerPhase::Installed);

        worker.activate().await.expect("activate");
        let status = worker.status().await;
        assert_eq!(status.phase, WorkerPhase::Active);
        assert_eq!(
            status.active_generation.as_ref().map(CacheGeneration::as_str),
            Some("v1")
        );
        assert_eq!(status.installed_generation, None);
    }

    #[tokio::test]
    async fn fetches_before_activation_are_network_only() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, _) = worker(&network);
        worker.install(manifest("v1")).await.expect("install");
        network.reset_calls();

        let served = worker
            .fetch(&FetchRequest::get("/css/offline.css"))
            .await
            .expect("served");
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn active_worker_serves_offline_document() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, cache) = worker(&network);
        let shell = manifest("v1");
        worker.install(shell.clone()).await.expect("install");
        worker.activate().await.expect("activate");

        network.set_offline(true);
        let served = worker
            .fetch(&FetchRequest::document("/dashboard"))
            .await
            .expect("served");
        let stored = cache
            .lookup(shell.generation(), shell.offline_fallback())
            .await
            .expect("stored fallback");
        assert_eq!(served.source, ResponseSource::OfflineFallback);
        assert_eq!(served.response.body, stored.body);
    }

    #[tokio::test]
    async fn failed_install_keeps_previous_generation_serving() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, _) = worker(&network);
        worker.install(manifest("v1")).await.expect("install v1");
        worker.activate().await.expect("activate v1");

        network.fail("/manifest.json");
        let error = worker
            .install(manifest("v2"))
            .await
            .expect_err("install v2 fails");
        assert!(matches!(
            error,
            WorkerError::Cache(CacheError::WarmFailed { .. })
        ));

        let status = worker.status().await;
        assert_eq!(status.phase, WorkerPhase::Active);
        assert_eq!(
            status.active_generation.as_ref().map(CacheGeneration::as_str),
            Some("v1")
        );

        network.reset_calls();
        let served = worker
            .fetch(&FetchRequest::get("/css/offline.css"))
            .await
            .expect("served");
        assert_eq!(served.source, ResponseSource::Cache);
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn activation_evicts_previous_generation() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, cache) = worker(&network);
        let v1 = manifest("v1");
        worker.install(v1.clone()).await.expect("install v1");
        worker.activate().await.expect("activate v1");

        worker.install(manifest("v2")).await.expect("install v2");
        let evicted = worker.activate().await.expect("activate v2");

        assert_eq!(evicted, vec![v1.generation().clone()]);
        assert_eq!(cache.state(v1.generation()), GenerationState::Stale);
        assert!(
            cache
                .lookup(v1.generation(), &RequestKey::get("/index.html"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn activation_requires_an_installed_generation() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, _) = worker(&network);
        assert!(matches!(
            worker.activate().await,
            Err(WorkerError::NothingInstalled)
        ));
        assert_eq!(worker.phase(), WorkerPhase::Idle);
    }

    #[tokio::test]
    async fn reinstalling_a_restored_generation_skips_the_warm() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, cache) = worker(&network);
        let shell = manifest("v1");
        cache
            .warm(&shell, network.as_ref())
            .await
            .expect("warm before install");
        network.reset_calls();

        let outcome = worker.install(shell).await.expect("install");
        assert!(matches!(outcome, InstallOutcome::AlreadyCached { .. }));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn restored_generation_is_adopted_when_install_fails() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, cache) = worker(&network);
        let v1 = manifest("v1");
        cache
            .warm(&v1, network.as_ref())
            .await
            .expect("warm before restart");

        network.set_offline(true);
        assert!(worker.install(manifest("v2")).await.is_err());
        assert_eq!(worker.phase(), WorkerPhase::Idle);

        worker.adopt(v1.clone()).await.expect("adopt");
        let status = worker.status().await;
        assert_eq!(status.phase, WorkerPhase::Active);
        assert_eq!(status.active_generation.as_ref(), Some(v1.generation()));
        assert_eq!(cache.state(v1.generation()), GenerationState::Ready);

        let served = worker
            .fetch(&FetchRequest::document("/dashboard"))
            .await
            .expect("served");
        assert_eq!(served.source, ResponseSource::OfflineFallback);
    }

    #[tokio::test]
    async fn adopt_requires_a_cached_generation_and_no_active_one() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, _) = worker(&network);
        assert!(matches!(
            worker.adopt(manifest("v0")).await,
            Err(WorkerError::NotCached(_))
        ));
        assert_eq!(worker.phase(), WorkerPhase::Idle);

        let v1 = manifest("v1");
        worker.install(v1.clone()).await.expect("install");
        worker.activate().await.expect("activate");
        assert!(matches!(
            worker.adopt(v1).await,
            Err(WorkerError::AlreadyActive(_))
        ));
        assert_eq!(worker.phase(), WorkerPhase::Active);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_the_active_snapshot() {
        let network = Arc::new(FakeNetwork::with_shell_assets());
        let (worker, _) = worker(&network);
        worker.install(manifest("v1")).await.expect("install");
        worker.activate().await.expect("activate");
        let worker = Arc::new(worker);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let worker = Arc::clone(&worker);
            tasks.push(tokio::spawn(async move {
                worker.fetch(&FetchRequest::get("/index.html")).await
            }));
        }
        for task in tasks {
            let served = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("no deadlock")
                .expect("join")
                .expect("served");
            assert_eq!(served.source, ResponseSource::Cache);
        }
    }
}
