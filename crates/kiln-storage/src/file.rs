//! Persistent [`KvStore`] backed by one JSON document per namespace.
//!
//! Namespace `plugin:weather` lives in `{root}/<hex(namespace)>.json`.
//! Writers hold the namespace's write lock across read-modify-write and
//! replace the file atomically (temp file in the same directory, fsync,
//! rename), so readers never observe a torn document.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::kv::{KvEntry, KvStore, validate_key, validate_namespace};

#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceFile {
    namespace: String,
    next_seq: u64,
    #[serde(default)]
    entries: BTreeMap<String, StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    /// Base64-encoded value bytes.
    value: String,
    seq: u64,
}

/// File-backed key-value store rooted at a directory.
#[derive(Debug)]
pub struct FileKvStore {
    root: PathBuf,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl FileKvStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    /// The directory holding the namespace files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, namespace: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{}.json", hex::encode(namespace)))
    }

    fn load(&self, namespace: &str) -> StorageResult<NamespaceFile> {
        match std::fs::read(self.path_for(namespace)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NamespaceFile {
                namespace: namespace.to_string(),
                ..NamespaceFile::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, file: &NamespaceFile) -> StorageResult<()> {
        let path = self.path_for(&file.namespace);
        if file.entries.is_empty() {
            return match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        let body = serde_json::to_vec_pretty(file)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| StorageError::Internal(format!("failed to replace {}: {e}", path.display())))?;
        debug!(path = %path.display(), entries = file.entries.len(), "persisted namespace");
        Ok(())
    }

    fn decode(value: &str) -> StorageResult<Vec<u8>> {
        BASE64
            .decode(value)
            .map_err(|e| StorageError::Serialization(format!("corrupt value encoding: {e}")))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.read().await;
        let file = self.load(namespace)?;
        file.entries
            .get(key)
            .map(|e| Self::decode(&e.value))
            .transpose()
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.write().await;
        let mut file = self.load(namespace)?;
        let seq = file.next_seq;
        file.next_seq = seq.saturating_add(1);
        file.entries.insert(
            key.to_string(),
            StoredEntry {
                value: BASE64.encode(value),
                seq,
            },
        );
        self.store(&file)
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.write().await;
        let mut file = self.load(namespace)?;
        let existed = file.entries.remove(key).is_some();
        if existed {
            self.store(&file)?;
        }
        Ok(existed)
    }

    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.read().await;
        Ok(self.load(namespace)?.entries.contains_key(key))
    }

    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        validate_namespace(namespace)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.read().await;
        Ok(self.load(namespace)?.entries.into_keys().collect())
    }

    async fn entries(&self, namespace: &str) -> StorageResult<Vec<KvEntry>> {
        validate_namespace(namespace)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.read().await;
        self.load(namespace)?
            .entries
            .into_iter()
            .map(|(key, stored)| {
                Ok(KvEntry {
                    namespace: namespace.to_string(),
                    key,
                    value: Self::decode(&stored.value)?,
                    seq: stored.seq,
                })
            })
            .collect()
    }

    async fn clear_namespace(&self, namespace: &str) -> StorageResult<u64> {
        validate_namespace(namespace)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.write().await;
        let mut file = self.load(namespace)?;
        let removed = u64::try_from(file.entries.len()).unwrap_or(u64::MAX);
        file.entries.clear();
        self.store(&file)?;
        Ok(removed)
    }
}
