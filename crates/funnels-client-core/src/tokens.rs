use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::storage::{ListenerId, SharedStorage, StorageChange, StorageError};

pub const ACCESS_KEY: &str = "access";
pub const REFRESH_KEY: &str = "refresh";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.access.is_empty() && !self.refresh.is_empty()
    }

    /// A half-present pair is "no session", never an error.
    fn from_parts(access: Option<String>, refresh: Option<String>) -> Option<Self> {
        let pair = Self::new(access?, refresh?);
        pair.is_complete().then_some(pair)
    }

    fn from_change(change: &StorageChange) -> Option<Self> {
        Self::from_parts(
            change.value(ACCESS_KEY).map(ToString::to_string),
            change.value(REFRESH_KEY).map(ToString::to_string),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Unchanged,
    Updated,
}

impl WriteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("token pair must carry both an access and a refresh token")]
    IncompletePair,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One listener's view of the persisted session tokens.
///
/// Clones share the listener identity; [`TokenStore::open`] on the same
/// [`SharedStorage`] creates a new listener that is notified of this one's
/// writes.
#[derive(Debug, Clone)]
pub struct TokenStore {
    storage: Arc<SharedStorage>,
    listener: ListenerId,
}

impl TokenStore {
    pub fn open(storage: &Arc<SharedStorage>) -> Self {
        Self {
            storage: Arc::clone(storage),
            listener: storage.register_listener(),
        }
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    pub fn read(&self) -> Result<Option<TokenPair>, TokenStoreError> {
        read_pair(&self.storage)
    }

    pub fn write(&self, pair: &TokenPair) -> Result<WriteOutcome, TokenStoreError> {
        if !pair.is_complete() {
            return Err(TokenStoreError::IncompletePair);
        }

        let changed = self.storage.compare_and_set(
            self.listener,
            &[
                (ACCESS_KEY, pair.access.as_str()),
                (REFRESH_KEY, pair.refresh.as_str()),
            ],
        )?;

        if changed {
            tracing::debug!(
                target: "funnels.client.tokens",
                listener = self.listener.as_u64(),
                "token pair updated",
            );
            Ok(WriteOutcome::Updated)
        } else {
            Ok(WriteOutcome::Unchanged)
        }
    }

    pub fn on_external_change(&self) -> ExternalTokenChanges {
        ExternalTokenChanges {
            storage: Arc::clone(&self.storage),
            listener: self.listener,
            receiver: self.storage.subscribe(),
        }
    }
}

fn read_pair(storage: &SharedStorage) -> Result<Option<TokenPair>, TokenStoreError> {
    let mut values = storage.get_many(&[ACCESS_KEY, REFRESH_KEY])?.into_iter();
    let access = values.next().flatten();
    let refresh = values.next().flatten();
    Ok(TokenPair::from_parts(access, refresh))
}

/// Token pairs written by other listeners of the same medium.
pub struct ExternalTokenChanges {
    storage: Arc<SharedStorage>,
    listener: ListenerId,
    receiver: broadcast::Receiver<StorageChange>,
}

impl ExternalTokenChanges {
    /// Waits for the next externally written pair. Returns `None` once the
    /// storage is gone.
    pub async fn recv(&mut self) -> Option<TokenPair> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => {
                    if let Some(pair) = self.accept(&change) {
                        return Some(pair);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    if let Some(pair) = self.resync(skipped) {
                        return Some(pair);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<TokenPair> {
        loop {
            match self.receiver.try_recv() {
                Ok(change) => {
                    if let Some(pair) = self.accept(&change) {
                        return Some(pair);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    if let Some(pair) = self.resync(skipped) {
                        return Some(pair);
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn accept(&self, change: &StorageChange) -> Option<TokenPair> {
        if change.origin == self.listener {
            return None;
        }
        TokenPair::from_change(change)
    }

    // Missed notifications collapse into the current stored pair.
    fn resync(&self, skipped: u64) -> Option<TokenPair> {
        tracing::warn!(
            target: "funnels.client.tokens",
            listener = self.listener.as_u64(),
            skipped,
            "token change subscriber lagged; re-reading stored pair",
        );
        match read_pair(&self.storage) {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(
                    target: "funnels.client.tokens",
                    error = %error,
                    "failed to re-read token pair after lag",
                );
                None
            }
        }
    }
}
