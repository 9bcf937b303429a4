//! Offline resilience for the funnels web shell: a versioned cache of shell
//! assets, the request interception policy in front of the network, and the
//! install/activate lifecycle that ties them together.

pub mod cache;
pub mod interceptor;
pub mod manifest;
pub mod network;
pub mod store;
pub mod worker;

pub use cache::{CacheController, CacheError, GenerationState, WarmReport};
pub use interceptor::{
    FetchInterceptor, InterceptError, InterceptedResponse, InterceptorPolicy, ResponseSource,
};
pub use manifest::{
    CacheGeneration, CacheManifest, DEFAULT_CACHE_VERSION, ManifestError, OFFLINE_FALLBACK_PATH,
    RequestKey, SHELL_ASSET_PATHS,
};
pub use network::{
    FetchRequest, HttpNetwork, Network, NetworkError, RequestDestination, StoredResponse,
    is_hop_by_hop,
};
pub use store::{CacheStorage, DiskCacheStorage, MemoryCacheStorage};
pub use worker::{InstallOutcome, OfflineWorker, WorkerError, WorkerPhase, WorkerStatus};
