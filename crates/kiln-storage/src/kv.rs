//! Namespaced key-value store trait and the in-memory implementation.
//!
//! Every operation is scoped to a namespace. Plugins receive a
//! [`ScopedKvStore`] pre-bound to `plugin:{plugin_id}` and never see
//! namespaces directly, so one plugin cannot read another plugin's keys.
//!
//! Entries carry a write sequence number. It increases on every `set` and
//! is what [`ScopedKvStore::recall`] uses to order equally relevant hits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StorageError, StorageResult};
use crate::recall;

/// Separator used when rendering a fully-qualified entry name.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Validate that a namespace is usable as a key prefix.
pub(crate) fn validate_namespace(namespace: &str) -> StorageResult<()> {
    if namespace.is_empty() {
        return Err(StorageError::InvalidKey(
            "namespace must not be empty".into(),
        ));
    }
    if namespace.contains('\0') {
        return Err(StorageError::InvalidKey(
            "namespace must not contain null bytes".into(),
        ));
    }
    Ok(())
}

/// Keys must be non-empty and free of null bytes.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".into()));
    }
    if key.contains('\0') {
        return Err(StorageError::InvalidKey(
            "key must not contain null bytes".into(),
        ));
    }
    Ok(())
}

/// A stored entry together with its namespace and write sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The namespace this entry belongs to.
    pub namespace: String,
    /// The key within the namespace.
    pub key: String,
    /// The raw value bytes.
    pub value: Vec<u8>,
    /// Write sequence; larger means written more recently.
    pub seq: u64,
}

impl KvEntry {
    /// The fully-qualified name, `{namespace}:{key}`.
    #[must_use]
    pub fn qualified_key(&self) -> String {
        format!("{}{NAMESPACE_SEPARATOR}{}", self.namespace, self.key)
    }

    /// The value decoded as JSON, if it is valid JSON.
    #[must_use]
    pub fn json_value(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.value).ok()
    }
}

/// Namespaced byte-level key-value storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value by namespace and key. Returns `None` if absent.
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Set a value, overwriting any existing one.
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// Check if a key exists.
    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// List all keys in a namespace, sorted.
    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>>;

    /// Every entry in a namespace, with values and write sequences.
    async fn entries(&self, namespace: &str) -> StorageResult<Vec<KvEntry>>;

    /// Delete all keys in a namespace. Returns how many were removed.
    async fn clear_namespace(&self, namespace: &str) -> StorageResult<u64>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    seq: u64,
}

/// In-memory key-value store for tests and ephemeral hosts.
///
/// Each namespace lives in its own shard entry, so writers to different
/// plugins never contend on the same lock.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    namespaces: DashMap<String, BTreeMap<String, Slot>>,
    next_seq: AtomicU64,
}

impl MemoryKvStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key).map(|slot| slot.value.clone())))
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        let seq = self.bump();
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), Slot { value, seq });
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        Ok(self
            .namespaces
            .get_mut(namespace)
            .is_some_and(|mut ns| ns.remove(key).is_some()))
    }

    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        Ok(self
            .namespaces
            .get(namespace)
            .is_some_and(|ns| ns.contains_key(key)))
    }

    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        validate_namespace(namespace)?;
        Ok(self
            .namespaces
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn entries(&self, namespace: &str) -> StorageResult<Vec<KvEntry>> {
        validate_namespace(namespace)?;
        Ok(self
            .namespaces
            .get(namespace)
            .map(|ns| {
                ns.iter()
                    .map(|(key, slot)| KvEntry {
                        namespace: namespace.to_string(),
                        key: key.clone(),
                        value: slot.value.clone(),
                        seq: slot.seq,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear_namespace(&self, namespace: &str) -> StorageResult<u64> {
        validate_namespace(namespace)?;
        let removed = self
            .namespaces
            .remove(namespace)
            .map_or(0, |(_, ns)| ns.len());
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}

/// A [`KvStore`] handle pre-bound to a single namespace.
#[derive(Clone)]
pub struct ScopedKvStore {
    store: Arc<dyn KvStore>,
    namespace: String,
}

impl std::fmt::Debug for ScopedKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedKvStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl ScopedKvStore {
    /// Bind `store` to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if the namespace is invalid.
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> StorageResult<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self { store, namespace })
    }

    /// The bound namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get raw bytes.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.store.get(&self.namespace, key).await
    }

    /// Set raw bytes.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.store.set(&self.namespace, key, value).await
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.store.delete(&self.namespace, key).await
    }

    /// Check if a key exists.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.store.exists(&self.namespace, key).await
    }

    /// List keys in the namespace.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn list_keys(&self) -> StorageResult<Vec<String>> {
        self.store.list_keys(&self.namespace).await
    }

    /// Remove every entry in the namespace.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn clear(&self) -> StorageResult<u64> {
        self.store.clear_namespace(&self.namespace).await
    }

    /// Get and deserialize a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the stored bytes are not
    /// valid JSON for `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize and store a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if `value` cannot be encoded.
    pub async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes).await
    }

    /// Relevance-ranked lookup over the namespace.
    ///
    /// Returns at most `limit` entries, most relevant first; equally
    /// relevant entries are ordered most-recently-written first.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn recall(&self, query: &str, limit: usize) -> StorageResult<Vec<KvEntry>> {
        let entries = self.store.entries(&self.namespace).await?;
        Ok(recall::rank(entries, query, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryKvStore::new();
        store.set("plugin:a", "k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.get("plugin:a", "k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.exists("plugin:a", "k").await.unwrap());
        assert!(store.delete("plugin:a", "k").await.unwrap());
        assert!(!store.delete("plugin:a", "k").await.unwrap());
        assert!(store.get("plugin:a", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = MemoryKvStore::new();
        store.set("plugin:a", "k", b"1".to_vec()).await.unwrap();
        store.set("plugin:b", "k", b"2".to_vec()).await.unwrap();
        assert_eq!(store.get("plugin:a", "k").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("plugin:b", "k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn clear_namespace_leaves_others() {
        let store = MemoryKvStore::new();
        store.set("plugin:a", "x", vec![1]).await.unwrap();
        store.set("plugin:a", "y", vec![2]).await.unwrap();
        store.set("plugin:b", "x", vec![3]).await.unwrap();

        assert_eq!(store.clear_namespace("plugin:a").await.unwrap(), 2);
        assert!(!store.exists("plugin:a", "x").await.unwrap());
        assert!(store.exists("plugin:b", "x").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_empty_and_null_keys() {
        let store = MemoryKvStore::new();
        assert!(store.set("", "k", vec![]).await.is_err());
        assert!(store.set("ns", "", vec![]).await.is_err());
        assert!(store.set("ns", "a\0b", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn sequence_increases_on_overwrite() {
        let store = MemoryKvStore::new();
        store.set("ns", "a", vec![1]).await.unwrap();
        store.set("ns", "b", vec![1]).await.unwrap();
        store.set("ns", "a", vec![2]).await.unwrap();

        let entries = store.entries("ns").await.unwrap();
        let a = entries.iter().find(|e| e.key == "a").unwrap();
        let b = entries.iter().find(|e| e.key == "b").unwrap();
        assert!(a.seq > b.seq);
        assert_eq!(a.qualified_key(), "ns:a");
    }

    #[tokio::test]
    async fn scoped_json_roundtrip() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let scoped = ScopedKvStore::new(store, "plugin:weather").unwrap();

        scoped
            .set_json("last", &serde_json::json!({"city": "Oslo"}))
            .await
            .unwrap();
        let value: serde_json::Value = scoped.get_json("last").await.unwrap().unwrap();
        assert_eq!(value["city"], "Oslo");
        assert_eq!(scoped.list_keys().await.unwrap(), vec!["last".to_string()]);
    }
}
