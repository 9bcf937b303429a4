//! Persistence for committed cache generations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cache::CacheError;
use crate::manifest::{CacheGeneration, RequestKey};
use crate::network::StoredResponse;

const INDEX_FILE_NAME: &str = "index.json";
const STAGING_PREFIX: &str = ".staging-";

#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Makes a whole generation visible at once. Replaces any previous commit
    /// of the same generation.
    async fn commit_generation(
        &self,
        generation: &CacheGeneration,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError>;

    async fn get(
        &self,
        generation: &CacheGeneration,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError>;

    /// Adds one entry to an already committed generation.
    async fn put(
        &self,
        generation: &CacheGeneration,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError>;

    async fn generations(&self) -> Result<Vec<CacheGeneration>, CacheError>;

    async fn delete_generation(&self, generation: &CacheGeneration) -> Result<(), CacheError>;

    /// Removes what interrupted commits left behind and returns how many
    /// leftovers were dropped.
    async fn discard_incomplete(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

type GenerationEntries = HashMap<RequestKey, StoredResponse>;

#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    generations: RwLock<BTreeMap<CacheGeneration, GenerationEntries>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn commit_generation(
        &self,
        generation: &CacheGeneration,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError> {
        let entries = entries.into_iter().collect();
        self.generations
            .write()
            .await
            .insert(generation.clone(), entries);
        Ok(())
    }

    async fn get(
        &self,
        generation: &CacheGeneration,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError> {
        Ok(self
            .generations
            .read()
            .await
            .get(generation)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(
        &self,
        generation: &CacheGeneration,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        let mut generations = self.generations.write().await;
        let entries = generations
            .get_mut(generation)
            .ok_or_else(|| CacheError::NotReady(generation.clone()))?;
        entries.insert(key, response);
        Ok(())
    }

    async fn generations(&self) -> Result<Vec<CacheGeneration>, CacheError> {
        Ok(self.generations.read().await.keys().cloned().collect())
    }

    async fn delete_generation(&self, generation: &CacheGeneration) -> Result<(), CacheError> {
        self.generations.write().await.remove(generation);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GenerationIndex {
    entries: BTreeMap<RequestKey, IndexedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexedEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body_file: String,
}

/// One directory per generation under `root`, holding `index.json` and one
/// body file per entry named by the SHA-256 of its request key.
///
/// Generations are assembled in a hidden staging directory and renamed into
/// place, so a crash mid-commit never leaves a partial generation visible.
/// Readers hold `index_lock` shared while they load an index and its body;
/// every mutation of a committed generation holds it exclusively.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    index_lock: RwLock<()>,
    staging: StdMutex<HashSet<PathBuf>>,
}

impl DiskCacheStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_lock: RwLock::new(()),
            staging: StdMutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, generation: &CacheGeneration) -> PathBuf {
        self.root.join(generation.as_str())
    }

    async fn write_generation(
        &self,
        staging: &Path,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError> {
        create_dir(staging).await?;
        let mut index = GenerationIndex::default();
        for (key, response) in entries {
            let body_file = body_file_name(&key);
            write_file(&staging.join(&body_file), &response.body).await?;
            index.entries.insert(
                key,
                IndexedEntry {
                    status: response.status,
                    headers: response.headers,
                    body_file,
                },
            );
        }
        write_index(staging, &index).await
    }

    async fn commit_staged(
        &self,
        generation: &CacheGeneration,
        staging: &Path,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<PathBuf, CacheError> {
        if let Err(error) = self.write_generation(staging, entries).await {
            let _ = tokio::fs::remove_dir_all(staging).await;
            return Err(error);
        }

        let _guard = self.index_lock.write().await;
        let target = self.generation_dir(generation);
        remove_dir_if_present(&target).await?;
        tokio::fs::rename(staging, &target)
            .await
            .map_err(|source| CacheError::Io {
                path: target.clone(),
                source,
            })?;
        Ok(target)
    }

    fn lock_staging(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.staging
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn commit_generation(
        &self,
        generation: &CacheGeneration,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError> {
        let staging = self
            .root
            .join(format!("{STAGING_PREFIX}{}", Uuid::new_v4().simple()));
        self.lock_staging().insert(staging.clone());
        let committed = self.commit_staged(generation, &staging, entries).await;
        self.lock_staging().remove(&staging);
        let target = committed?;

        tracing::debug!(
            target: "funnels.offline.store",
            generation = %generation,
            path = %target.display(),
            "cache generation committed to disk",
        );
        Ok(())
    }

    async fn get(
        &self,
        generation: &CacheGeneration,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError> {
        let _guard = self.index_lock.read().await;
        let dir = self.generation_dir(generation);
        let Some(mut index) = read_index(&dir).await? else {
            return Ok(None);
        };
        let Some(entry) = index.entries.remove(key) else {
            return Ok(None);
        };

        let body_path = dir.join(&entry.body_file);
        let body = tokio::fs::read(&body_path)
            .await
            .map_err(|source| CacheError::Io {
                path: body_path,
                source,
            })?;

        Ok(Some(StoredResponse {
            status: entry.status,
            headers: entry.headers,
            body,
        }))
    }

    async fn put(
        &self,
        generation: &CacheGeneration,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        let _guard = self.index_lock.write().await;
        let dir = self.generation_dir(generation);
        let Some(mut index) = read_index(&dir).await? else {
            return Err(CacheError::NotReady(generation.clone()));
        };

        let body_file = body_file_name(&key);
        replace_file(&dir, &body_file, &response.body).await?;
        index.entries.insert(
            key,
            IndexedEntry {
                status: response.status,
                headers: response.headers,
                body_file,
            },
        );
        write_index(&dir, &index).await
    }

    async fn generations(&self) -> Result<Vec<CacheGeneration>, CacheError> {
        let io_error = |source| CacheError::Io {
            path: self.root.clone(),
            source,
        };

        let mut reader = match tokio::fs::read_dir(&self.root).await {
            Ok(reader) => reader,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(source)),
        };

        let mut generations = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let Ok(generation) = CacheGeneration::new(name) else {
                continue;
            };
            let index_present = tokio::fs::try_exists(entry.path().join(INDEX_FILE_NAME))
                .await
                .unwrap_or(false);
            if index_present {
                generations.push(generation);
            }
        }
        generations.sort();
        Ok(generations)
    }

    async fn delete_generation(&self, generation: &CacheGeneration) -> Result<(), CacheError> {
        let _guard = self.index_lock.write().await;
        remove_dir_if_present(&self.generation_dir(generation)).await
    }

    async fn discard_incomplete(&self) -> Result<usize, CacheError> {
        let io_error = |source| CacheError::Io {
            path: self.root.clone(),
            source,
        };
        let mut reader = match tokio::fs::read_dir(&self.root).await {
            Ok(reader) => reader,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(io_error(source)),
        };

        let mut discarded = 0;
        while let Some(entry) = reader.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            let is_staging = entry
                .file_name()
                .to_string_lossy()
                .starts_with(STAGING_PREFIX);
            if !is_staging || self.lock_staging().contains(&path) {
                continue;
            }
            remove_dir_if_present(&path).await?;
            tracing::debug!(
                target: "funnels.offline.store",
                path = %path.display(),
                "removed interrupted cache commit",
            );
            discarded += 1;
        }
        Ok(discarded)
    }
}


fn body_file_name(key: &RequestKey) -> String {
    format!("{}.body", hex::encode(Sha256::digest(key.as_str().as_bytes())))
}

async fn create_dir(path: &Path) -> Result<(), CacheError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes `contents` next to `name` and renames it over `name`, so readers
/// see either the old or the new file, never a partial one.
async fn replace_file(dir: &Path, name: &str, contents: &[u8]) -> Result<(), CacheError> {
    let path = dir.join(name);
    let temp_path = dir.join(format!("{name}.{}.tmp", Uuid::new_v4().simple()));
    write_file(&temp_path, contents).await?;
    tokio::fs::rename(&temp_path, &path)
        .await
        .map_err(|source| CacheError::Io { path, source })
}

async fn remove_dir_if_present(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn read_index(dir: &Path) -> Result<Option<GenerationIndex>, CacheError> {
    let path = dir.join(INDEX_FILE_NAME);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(CacheError::Io { path, source }),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| CacheError::Index { path, source })
}

async fn write_index(dir: &Path, index: &GenerationIndex) -> Result<(), CacheError> {
    let payload = serde_json::to_vec_pretty(index).map_err(|source| CacheError::Index {
        path: dir.join(INDEX_FILE_NAME),
        source,
    })?;
    replace_file(dir, INDEX_FILE_NAME, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation(tag: &str) -> CacheGeneration {
        CacheGeneration::new(tag).expect("generation")
    }

    fn shell_entries() -> Vec<(RequestKey, StoredResponse)> {
        vec![
            (
                RequestKey::get("/index.html"),
                StoredResponse::new(200, "<html>shell</html>")
                    .with_header("content-type", "text/html"),
            ),
            (
                RequestKey::get("/offline.html"),
                StoredResponse::new(200, "<html>offline</html>"),
            ),
        ]
    }

    #[tokio::test]
    async fn disk_generation_is_readable_after_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let v1 = generation("v1");

        DiskCacheStorage::new(temp.path())
            .commit_generation(&v1, shell_entries())
            .await
            .expect("commit");

        let reopened = DiskCacheStorage::new(temp.path());
        assert_eq!(reopened.generations().await.expect("list"), vec![v1.clone()]);
        let hit = reopened
            .get(&v1, &RequestKey::get("/index.html"))
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.body, b"<html>shell</html>");
        assert_eq!(hit.header("content-type"), Some("text/html"));
        assert!(
            temp.path()
                .join("v1")
                .join(body_file_name(&RequestKey::get("/index.html")))
                .is_file()
        );
    }

    #[tokio::test]
    async fn staging_leftovers_are_not_generations() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join(".staging-crashed")).expect("staging");
        std::fs::create_dir_all(temp.path().join("no-index")).expect("dir");

        let storage = DiskCacheStorage::new(temp.path());
        assert!(storage.generations().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn discard_incomplete_sweeps_staging_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = DiskCacheStorage::new(temp.path());
        let v1 = generation("v1");
        storage
            .commit_generation(&v1, shell_entries())
            .await
            .expect("commit");
        std::fs::create_dir_all(temp.path().join(".staging-crashed")).expect("staging");

        assert_eq!(storage.discard_incomplete().await.expect("discard"), 1);
        assert!(!temp.path().join(".staging-crashed").exists());
        assert_eq!(storage.generations().await.expect("list"), vec![v1]);
        assert_eq!(storage.discard_incomplete().await.expect("discard again"), 0);
        assert_eq!(
            MemoryCacheStorage::new()
                .discard_incomplete()
                .await
                .expect("memory"),
            0
        );
    }

    #[tokio::test]
    async fn concurrent_puts_never_expose_partial_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = std::sync::Arc::new(DiskCacheStorage::new(temp.path()));
        let v1 = generation("v1");
        let asset = RequestKey::get("/app.js");
        storage
            .commit_generation(&v1, shell_entries())
            .await
            .expect("commit");

        let versions = [("a", "a".repeat(64 * 1024)), ("b", "b".repeat(3))];
        let mut writers = Vec::new();
        for round in 0..8 {
            let storage = std::sync::Arc::clone(&storage);
            let (tag, body) = versions[round % 2].clone();
            let (v1, asset) = (v1.clone(), asset.clone());
            writers.push(tokio::spawn(async move {
                let response = StoredResponse::new(200, body).with_header("x-version", tag);
                storage.put(&v1, asset, response).await
            }));
        }

        for _ in 0..32 {
            if let Some(hit) = storage.get(&v1, &asset).await.expect("get") {
                let expected = match hit.header("x-version") {
                    Some("a") => &versions[0].1,
                    Some("b") => &versions[1].1,
                    other => panic!("unexpected version {other:?}"),
                };
                assert_eq!(hit.body, expected.as_bytes());
            }
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.expect("join").expect("put");
        }
    }

    #[tokio::test]
    async fn put_extends_committed_generation_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = DiskCacheStorage::new(temp.path());
        let v1 = generation("v1");
        let asset = RequestKey::get("/app.js");

        let uncommitted = storage
            .put(&v1, asset.clone(), StoredResponse::new(200, "js"))
            .await;
        assert!(matches!(uncommitted, Err(CacheError::NotReady(_))));

        storage
            .commit_generation(&v1, shell_entries())
            .await
            .expect("commit");
        storage
            .put(&v1, asset.clone(), StoredResponse::new(200, "js"))
            .await
            .expect("put");
        let hit = storage.get(&v1, &asset).await.expect("get").expect("hit");
        assert_eq!(hit.body, b"js");
    }

    #[tokio::test]
    async fn delete_removes_generation_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = DiskCacheStorage::new(temp.path());
        let v1 = generation("v1");
        let v2 = generation("v2");
        storage
            .commit_generation(&v1, shell_entries())
            .await
            .expect("commit v1");
        storage
            .commit_generation(&v2, shell_entries())
            .await
            .expect("commit v2");

        storage.delete_generation(&v1).await.expect("delete");
        storage.delete_generation(&v1).await.expect("delete twice");

        assert_eq!(storage.generations().await.expect("list"), vec![v2]);
        assert!(!temp.path().join("v1").exists());
    }

    #[tokio::test]
    async fn memory_storage_put_requires_commit() {
        let storage = MemoryCacheStorage::new();
        let v1 = generation("v1");
        let result = storage
            .put(&v1, RequestKey::get("/a"), StoredResponse::new(200, "a"))
            .await;
        assert!(matches!(result, Err(CacheError::NotReady(_))));
    }
}
