//! Same-origin key/value medium shared by every open page of the shell.
//!
//! A [`SharedStorage`] pairs a [`StorageBackend`] with a change hub. Each
//! handle that registers on it is one listener (a tab, in browser terms) and
//! receives the changes written by every other listener.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to read storage file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write storage file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode storage payload: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Reads every key from one snapshot of the medium, in `keys` order.
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StorageError>;

    /// Writes every entry as one unit; readers never observe a subset.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StorageError> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(keys.iter().map(|key| entries.get(*key).cloned()).collect())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let mut stored = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (key, value) in entries {
            stored.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }
}

/// JSON file backend. The file is re-read on every access so that several
/// shell processes pointed at the same path observe each other's writes.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_entries(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
            Ok(entries) => Ok(entries),
            Err(error) => {
                tracing::warn!(
                    target: "funnels.client.storage",
                    path = %self.path.display(),
                    error = %error,
                    "failed to parse storage file; treating it as empty",
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn persist_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let write_error = |source| StorageError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(write_error)?;
            }
        }

        let payload = serde_json::to_vec_pretty(entries)?;
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&temp_path, payload).map_err(write_error)?;
        std::fs::rename(&temp_path, &self.path).map_err(write_error)?;
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load_entries()?.remove(key))
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StorageError> {
        let mut entries = self.load_entries()?;
        Ok(keys.iter().map(|key| entries.remove(*key)).collect())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StorageError> {
        let mut stored = self.load_entries()?;
        for (key, value) in entries {
            stored.insert((*key).to_string(), (*value).to_string());
        }
        self.persist_entries(&stored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub origin: ListenerId,
    pub entries: Vec<(String, String)>,
}

impl StorageChange {
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, value)| value.as_str())
    }
}

pub struct SharedStorage {
    backend: Box<dyn StorageBackend>,
    write_guard: Mutex<()>,
    changes: broadcast::Sender<StorageChange>,
    next_listener: AtomicU64,
}

impl SharedStorage {
    pub fn new(backend: impl StorageBackend + 'static) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend: Box::new(backend),
            write_guard: Mutex::new(()),
            changes,
            next_listener: AtomicU64::new(1),
        })
    }

    pub fn memory() -> Arc<Self> {
        Self::new(MemoryStorage::new())
    }

    pub fn file(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::new(FileStorage::new(path))
    }

    pub fn register_listener(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.backend.get(key)
    }

    pub fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StorageError> {
        self.backend.get_many(keys)
    }

    /// Writes `entries` unless every key already holds the given value.
    ///
    /// Returns `true` when the medium changed; only then is a
    /// [`StorageChange`] published to subscribers.
    pub fn compare_and_set(
        &self,
        origin: ListenerId,
        entries: &[(&str, &str)],
    ) -> Result<bool, StorageError> {
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let keys: Vec<&str> = entries.iter().map(|(key, _)| *key).collect();
        let current = self.backend.get_many(&keys)?;
        let unchanged = current
            .iter()
            .zip(entries)
            .all(|(stored, (_, value))| stored.as_deref() == Some(*value));
        if unchanged {
            return Ok(false);
        }

        self.backend.set_many(entries)?;
        let change = StorageChange {
            origin,
            entries: entries
                .iter()
                .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                .collect(),
        };
        // No subscribers is not an error.
        let _ = self.changes.send(change);
        Ok(true)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

impl std::fmt::Debug for SharedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStorage")
            .field("subscribers", &self.changes.receiver_count())
            .finish_non_exhaustive()
    }
}
