//! Kiln Storage - namespaced key-value storage for plugin memory.
//!
//! Two backends implement [`KvStore`]:
//!
//! - [`MemoryKvStore`]: in-process, for tests and short-lived hosts
//! - [`FileKvStore`]: one JSON document per namespace under a directory,
//!   written atomically
//!
//! Plugins see their memory through a [`ScopedKvStore`] bound to
//! `plugin:{plugin_id}`, so every entry is addressable as
//! `plugin:{plugin_id}:{key}` and removing a plugin is a single
//! [`KvStore::clear_namespace`] call.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod file;
pub mod kv;
pub mod recall;

pub use error::{StorageError, StorageResult};
pub use file::FileKvStore;
pub use kv::{KvEntry, KvStore, MemoryKvStore, NAMESPACE_SEPARATOR, ScopedKvStore};

/// Namespace holding a plugin's memory entries.
#[must_use]
pub fn plugin_namespace(plugin_id: &str) -> String {
    format!("plugin:{plugin_id}")
}
