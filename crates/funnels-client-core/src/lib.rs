//! Client-side core of the funnels web shell: persisted session tokens, the
//! typed UI/host message bridge and the flags the UI starts with.

pub mod bridge;
pub mod flags;
pub mod host;
pub mod storage;
pub mod tokens;

pub use bridge::{
    BridgeError, BridgeMessage, CorrelationId, Direction, HostBridge, HostPort, PendingConfirm,
    UiEvent, UiPort,
};
pub use flags::{DEFAULT_SERVICE_PORT, FlagsError, StartupFlags, derive_base_url};
pub use host::{HostCapabilities, HostDispatcher, HostError};
pub use storage::{
    FileStorage, ListenerId, MemoryStorage, SharedStorage, StorageBackend, StorageChange,
    StorageError,
};
pub use tokens::{
    ACCESS_KEY, ExternalTokenChanges, REFRESH_KEY, TokenPair, TokenStore, TokenStoreError,
    WriteOutcome,
};
