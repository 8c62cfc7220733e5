//! Plugin root management.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/
//!   plugins.lock
//!   .locks/<file_stem>.lock      per-identity install lock
//!   .locks/.swap.lock            held while a directory is swapped
//!   hello/                       plugin.toml, index.js, .kiln-install.toml
//!   @acme/weather/
//! ```
//!
//! Installs are staged in a hidden temp directory inside the root and
//! renamed into place, so readers never see a half-written plugin. The
//! swap itself (old aside, new in) runs under an exclusive lock that
//! readers ([`PluginStore::list`], [`PluginStore::get`] and
//! [`PluginStore::read`]) take shared, so they see exactly one complete
//! copy of every identity.

mod record;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use tempfile::TempDir;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub use record::{INSTALL_RECORD_FILE, InstallRecord};

use crate::build::ARTIFACT_FILE_NAME;
use crate::error::{PluginError, PluginResult};
use crate::fetch::Provenance;
use crate::integrity;
use crate::lockfile::{IntegrityViolation, LOCKFILE_NAME, LockedPlugin, PluginLockfile};
use crate::manifest::PluginManifest;
use crate::plugin::PluginId;

const LOCKS_DIR: &str = ".locks";
const SWAP_LOCK: &str = ".swap.lock";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// A plugin present in a plugin root.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPlugin {
    /// Identity.
    pub id: PluginId,
    /// Install directory.
    pub path: PathBuf,
    /// Installed manifest.
    pub manifest: PluginManifest,
    /// Install time.
    pub installed_at: DateTime<Utc>,
    /// Resolved source.
    pub source: Provenance,
    /// Verified registry checksum, if fetched from the registry.
    pub checksum: Option<String>,
    /// `blake3:` digest of the artifact.
    pub artifact_hash: String,
}

impl InstalledPlugin {
    /// Read an install directory.
    ///
    /// Directories without an install record (for instance plugins dropped
    /// into a search-path root by hand) are described from the filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest or artifact is unreadable.
    pub fn load(dir: &Path) -> PluginResult<Self> {
        let manifest = PluginManifest::load_from_dir(dir)?;
        let id = manifest.id()?;
        let record = InstallRecord::load(dir)?;

        Ok(match record {
            Some(r) => Self {
                id,
                path: dir.to_path_buf(),
                manifest,
                installed_at: r.installed_at,
                source: r.source,
                checksum: r.checksum,
                artifact_hash: r.artifact_hash,
            },
            None => {
                let artifact_hash = integrity::artifact_hash(&dir.join(ARTIFACT_FILE_NAME))?;
                let installed_at = std::fs::metadata(dir)
                    .and_then(|m| m.modified())
                    .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
                Self {
                    id,
                    path: dir.to_path_buf(),
                    manifest,
                    installed_at,
                    source: Provenance::Local {
                        path: dir.display().to_string(),
                    },
                    checksum: None,
                    artifact_hash,
                }
            },
        })
    }
}

/// Held for the duration of an install or removal of one identity.
#[derive(Debug)]
pub struct InstallGuard {
    id: PluginId,
    _local: OwnedMutexGuard<()>,
    _file: File,
}

impl InstallGuard {
    /// The locked identity.
    #[must_use]
    pub fn id(&self) -> &PluginId {
        &self.id
    }
}

/// Handle to one writable plugin root plus read-only search roots.
#[derive(Debug, Clone)]
pub struct PluginStore {
    root: PathBuf,
    search_path: Vec<PathBuf>,
    locks: Arc<DashMap<PluginId, Arc<Mutex<()>>>>,
}

impl PluginStore {
    /// Store rooted at `root`. The directory is created on first install.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            search_path: Vec::new(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Extra roots consulted by [`list`](Self::list) and [`get`](Self::get).
    #[must_use]
    pub fn with_search_path(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_path = roots;
        self
    }

    /// The writable root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The lockfile path.
    #[must_use]
    pub fn lockfile_path(&self) -> PathBuf {
        self.root.join(LOCKFILE_NAME)
    }

    /// Install directory for `id` in the writable root.
    #[must_use]
    pub fn plugin_dir(&self, id: &PluginId) -> PathBuf {
        self.root.join(id.relative_path())
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    /// Serialize installs and removals of `id`, both within this process
    /// and across processes sharing the root.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the lock file cannot be created or
    /// locked.
    pub async fn lock(&self, id: &PluginId) -> PluginResult<InstallGuard> {
        let local = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let local = local.lock_owned().await;

        let path = self.locks_dir().join(format!("{}.lock", id.file_stem()));
        let file = tokio::task::spawn_blocking(move || open_locked(&path, true))
            .await
            .map_err(|e| PluginError::io("install lock task failed", std::io::Error::other(e)))??;

        Ok(InstallGuard {
            id: id.clone(),
            _local: local,
            _file: file,
        })
    }

    /// Fresh hidden staging directory inside the root.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the root cannot be created.
    pub fn staging_dir(&self) -> PluginResult<TempDir> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            PluginError::io(format!("failed to create {}", self.root.display()), e)
        })?;
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| PluginError::io("failed to create staging directory", e))
    }

    /// Move a fully staged plugin directory into place and record it in
    /// the lockfile. Blocking.
    ///
    /// `staging` must already hold the manifest and artifact; the install
    /// record is written here. Any previous install of the same identity
    /// is replaced atomically and deleted afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] or [`PluginError::Lockfile`]. On error
    /// the previous install, if any, is left in place.
    pub fn commit(
        &self,
        guard: &InstallGuard,
        staging: TempDir,
        record: &InstallRecord,
    ) -> PluginResult<InstalledPlugin> {
        let id = guard.id();
        if record.id != *id {
            return Err(PluginError::InvalidId(format!(
                "install record for {} committed under the lock for {id}",
                record.id
            )));
        }
        record.write(staging.path())?;

        let target = self.plugin_dir(id);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PluginError::io(format!("failed to create {}", parent.display()), e))?;
        }

        let trash = tempfile::Builder::new()
            .prefix(TRASH_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| PluginError::io("failed to create trash directory", e))?;
        let backup = trash.path().join("previous");
        let staging_path = staging.keep();

        let replaced = {
            let _swap = self.swap_lock(true)?;
            let replaced = if target.exists() {
                std::fs::rename(&target, &backup).map_err(|e| {
                    PluginError::io(format!("failed to move aside {}", target.display()), e)
                })?;
                true
            } else {
                false
            };
            if let Err(e) = std::fs::rename(&staging_path, &target) {
                if replaced {
                    let _ = std::fs::rename(&backup, &target);
                }
                let _ = std::fs::remove_dir_all(&staging_path);
                return Err(PluginError::io(
                    format!("failed to move staged plugin into {}", target.display()),
                    e,
                ));
            }
            replaced
        };

        let locked = LockedPlugin {
            id: id.clone(),
            version: record.version.clone(),
            source: record.source.clone(),
            artifact_hash: record.artifact_hash.clone(),
            installed_at: record.installed_at,
        };
        if let Err(e) = PluginLockfile::update(&self.lockfile_path(), |lockfile| {
            lockfile.upsert(locked);
            Ok(())
        }) {
            let _swap = self.swap_lock(true);
            let _ = std::fs::rename(&target, &staging_path);
            if replaced {
                let _ = std::fs::rename(&backup, &target);
            }
            let _ = std::fs::remove_dir_all(&staging_path);
            return Err(e);
        }

        drop(trash);
        info!(plugin = %id, replaced, path = %target.display(), "Installed plugin");
        InstalledPlugin::load(&target)
    }

    /// Every plugin in the writable root, then any search-path plugin with
    /// an identity not already seen. Sorted by identity. Blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the writable root cannot be read.
    pub fn list(&self) -> PluginResult<Vec<InstalledPlugin>> {
        let mut plugins = if self.root.is_dir() {
            let _swap = self.swap_lock(false)?;
            scan_root(&self.root)?
        } else {
            Vec::new()
        };

        for extra in &self.search_path {
            if !extra.is_dir() {
                continue;
            }
            match scan_root(extra) {
                Ok(found) => {
                    for plugin in found {
                        if !plugins.iter().any(|p| p.id == plugin.id) {
                            plugins.push(plugin);
                        }
                    }
                },
                Err(e) => warn!(root = %extra.display(), error = %e, "Skipping unreadable search path"),
            }
        }

        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plugins)
    }

    /// Look up one plugin, writable root first. Blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PluginNotFound`] if no root holds it.
    pub fn get(&self, id: &PluginId) -> PluginResult<InstalledPlugin> {
        self.read(id, |plugin| Ok(plugin.clone()))
    }

    /// Look up one plugin and run `f` on it while no swap of the writable
    /// root can happen, so everything `f` reads from `plugin.path` belongs
    /// to a single install. Blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PluginNotFound`] if no root holds it, or
    /// whatever `f` returns.
    pub fn read<T>(
        &self,
        id: &PluginId,
        f: impl FnOnce(&InstalledPlugin) -> PluginResult<T>,
    ) -> PluginResult<T> {
        let _swap = if self.root.is_dir() {
            Some(self.swap_lock(false)?)
        } else {
            None
        };
        let dir = std::iter::once(&self.root)
            .chain(&self.search_path)
            .map(|root| root.join(id.relative_path()))
            .find(|dir| dir.join(crate::manifest::MANIFEST_FILE_NAME).is_file())
            .ok_or_else(|| PluginError::PluginNotFound(id.to_string()))?;
        let plugin = InstalledPlugin::load(&dir)?;
        f(&plugin)
    }

    /// Delete `id` from the writable root and drop its lockfile entry.
    /// Blocking. Memory purging is the caller's concern.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PluginNotFound`] if `id` is not installed in
    /// the writable root.
    pub fn remove(&self, guard: &InstallGuard) -> PluginResult<InstalledPlugin> {
        let id = guard.id();
        let dir = self.plugin_dir(id);
        if !dir.join(crate::manifest::MANIFEST_FILE_NAME).is_file() {
            return Err(PluginError::PluginNotFound(id.to_string()));
        }
        let removed = InstalledPlugin::load(&dir)?;

        // Lockfile first: a leftover directory is harmless, a dangling
        // entry is a permanent integrity violation.
        PluginLockfile::update(&self.lockfile_path(), |lockfile| {
            lockfile.remove(id);
            Ok(())
        })?;

        let trash = tempfile::Builder::new()
            .prefix(TRASH_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| PluginError::io("failed to create trash directory", e))?;
        {
            let _swap = self.swap_lock(true)?;
            std::fs::rename(&dir, trash.path().join("removed"))
                .map_err(|e| PluginError::io(format!("failed to remove {}", dir.display()), e))?;
        }
        drop(trash);

        if id.scope().is_some()
            && let Some(scope_dir) = dir.parent()
        {
            // Only succeeds when the scope is now empty.
            let _ = std::fs::remove_dir(scope_dir);
        }

        info!(plugin = %id, "Removed plugin");
        Ok(removed)
    }

    /// Compare the lockfile against the writable root. Blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] if the lockfile is unreadable.
    pub fn verify(&self) -> PluginResult<Vec<IntegrityViolation>> {
        let lockfile = PluginLockfile::load_or_default(&self.lockfile_path())?;
        Ok(lockfile.verify_integrity(&self.root))
    }

    fn swap_lock(&self, exclusive: bool) -> PluginResult<File> {
        open_locked(&self.locks_dir().join(SWAP_LOCK), exclusive)
    }
}

fn open_locked(path: &Path, exclusive: bool) -> PluginResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PluginError::io(format!("failed to create {}", parent.display()), e))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| PluginError::io(format!("failed to open {}", path.display()), e))?;
    let locked = if exclusive {
        file.lock_exclusive()
    } else {
        file.lock_shared()
    };
    locked.map_err(|e| PluginError::io(format!("failed to lock {}", path.display()), e))?;
    Ok(file)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Plugin directories directly under `root`, descending one level into
/// `@scope` directories.
fn scan_root(root: &Path) -> PluginResult<Vec<InstalledPlugin>> {
    let mut found = Vec::new();
    for dir in child_dirs(root)? {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('@') {
            for nested in child_dirs(&dir)? {
                load_into(&nested, &mut found);
            }
        } else {
            load_into(&dir, &mut found);
        }
    }
    Ok(found)
}

fn child_dirs(dir: &Path) -> PluginResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PluginError::io(format!("failed to read {}", dir.display()), e))?;
    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_str().is_none_or(is_hidden) {
            continue;
        }
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_into(dir: &Path, found: &mut Vec<InstalledPlugin>) {
    if !dir.join(crate::manifest::MANIFEST_FILE_NAME).is_file() {
        debug!(dir = %dir.display(), "Skipping directory without a manifest");
        return;
    }
    match InstalledPlugin::load(dir) {
        Ok(p) => found.push(p),
        Err(e) => warn!(dir = %dir.display(), error = %e, "Skipping unreadable plugin"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_plugin(store: &PluginStore, name: &str, version: &str, body: &str) -> TempDir {
        let staging = store.staging_dir().unwrap();
        std::fs::write(
            staging.path().join("plugin.toml"),
            format!("[plugin]\nname = \"{name}\"\nversion = \"{version}\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"index.js\"\n"),
        )
        .unwrap();
        std::fs::write(staging.path().join(ARTIFACT_FILE_NAME), body).unwrap();
        staging
    }

    fn record(name: &str, version: &str, body: &str) -> InstallRecord {
        InstallRecord {
            id: PluginId::new(name).unwrap(),
            version: version.into(),
            installed_at: Utc::now(),
            source: Provenance::Local { path: "/src".into() },
            checksum: None,
            artifact_hash: integrity::artifact_digest(body.as_bytes()),
            transformed: false,
            bundled: false,
        }
    }

    async fn install(store: &PluginStore, name: &str, version: &str, body: &str) -> InstalledPlugin {
        let id = PluginId::new(name).unwrap();
        let guard = store.lock(&id).await.unwrap();
        let staging = stage_plugin(store, name, version, body);
        store.commit(&guard, staging, &record(name, version, body)).unwrap()
    }

    #[tokio::test]
    async fn install_list_get_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path().join("plugins"));

        install(&store, "hello", "1.0.0", "1").await;
        install(&store, "@acme/weather", "0.2.0", "2").await;

        let listed = store.list().unwrap();
        let ids: Vec<_> = listed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["@acme/weather", "hello"]);
        assert!(store.root().join("@acme/weather/.kiln-install.toml").is_file());

        let got = store.get(&PluginId::new("hello").unwrap()).unwrap();
        assert_eq!(got.manifest.plugin.version, "1.0.0");
        assert!(store.verify().unwrap().is_empty());

        let id = PluginId::new("@acme/weather").unwrap();
        let guard = store.lock(&id).await.unwrap();
        store.remove(&guard).unwrap();
        drop(guard);
        assert!(!store.root().join("@acme").exists());
        assert_eq!(store.list().unwrap().len(), 1);

        let lockfile = PluginLockfile::load_or_default(&store.lockfile_path()).unwrap();
        assert!(lockfile.get(&id).is_none());
    }

    #[tokio::test]
    async fn reinstall_replaces_and_leaves_no_debris() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());

        install(&store, "hello", "1.0.0", "old").await;
        let second = install(&store, "hello", "1.1.0", "new").await;
        assert_eq!(second.manifest.plugin.version, "1.1.0");
        assert_eq!(
            std::fs::read_to_string(second.path.join(ARTIFACT_FILE_NAME)).unwrap(),
            "new"
        );

        let debris: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(STAGING_PREFIX) || n.starts_with(TRASH_PREFIX))
            .collect();
        assert!(debris.is_empty(), "{debris:?}");

        let lockfile = PluginLockfile::load_or_default(&store.lockfile_path()).unwrap();
        assert_eq!(lockfile.entries().len(), 1);
        assert_eq!(lockfile.entries()[0].version, "1.1.0");
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        let id = PluginId::new("ghost").unwrap();
        let guard = store.lock(&id).await.unwrap();
        assert!(matches!(
            store.remove(&guard).unwrap_err(),
            PluginError::PluginNotFound(_)
        ));
        assert!(matches!(
            store.get(&id).unwrap_err(),
            PluginError::PluginNotFound(_)
        ));
    }

    #[tokio::test]
    async fn search_path_plugins_are_listed_but_shadowed() {
        let tmp = tempfile::tempdir().unwrap();
        let extra = tmp.path().join("extra");
        let manual = extra.join("manual");
        std::fs::create_dir_all(&manual).unwrap();
        std::fs::write(
            manual.join("plugin.toml"),
            "[plugin]\nname = \"manual\"\nversion = \"0.1.0\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"index.js\"\n",
        )
        .unwrap();
        std::fs::write(manual.join(ARTIFACT_FILE_NAME), "x").unwrap();
        std::fs::create_dir_all(extra.join(".hidden")).unwrap();

        let store = PluginStore::new(tmp.path().join("root")).with_search_path(vec![extra]);
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(matches!(listed[0].source, Provenance::Local { .. }));
        assert_eq!(listed[0].artifact_hash, integrity::artifact_digest(b"x"));

        install(&store, "manual", "2.0.0", "y").await;
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].manifest.plugin.version, "2.0.0");
    }

    #[tokio::test]
    async fn tampered_artifact_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(tmp.path());
        let installed = install(&store, "hello", "1.0.0", "ok").await;
        std::fs::write(installed.path.join(ARTIFACT_FILE_NAME), "evil").unwrap();
        let violations = store.verify().unwrap();
        assert!(matches!(
            violations.as_slice(),
            [IntegrityViolation::HashMismatch { .. }]
        ));
    }
}
