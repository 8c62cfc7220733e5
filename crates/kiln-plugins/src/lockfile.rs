//! Plugin-root lockfile (`plugins.lock`).
//!
//! Records exactly what is installed, where it came from, and the blake3
//! digest of each built artifact, so `kiln list --verify` can detect
//! tampering or half-finished manual edits.
//!
//! ```toml
//! schema_version = 1
//!
//! [[plugin]]
//! id = "@acme/weather"
//! version = "1.2.0"
//! source = "registry:@acme/weather@1.2.0"
//! artifact_hash = "blake3:…"
//! installed_at = "2026-01-01T00:00:00Z"
//! ```

use std::fmt;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::build::ARTIFACT_FILE_NAME;
use crate::error::{PluginError, PluginResult};
use crate::fetch::Provenance;
use crate::integrity;
use crate::manifest::PluginManifest;
use crate::plugin::PluginId;

const SCHEMA_VERSION: u32 = 1;

/// Lockfile name inside the plugin root.
pub const LOCKFILE_NAME: &str = "plugins.lock";

/// The lockfile document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLockfile {
    schema_version: u32,
    #[serde(default, rename = "plugin")]
    entries: Vec<LockedPlugin>,
}

/// One installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedPlugin {
    /// Identity.
    pub id: PluginId,
    /// Manifest version at install time.
    pub version: String,
    /// Resolved source.
    pub source: Provenance,
    /// `blake3:<hex>` of the installed artifact.
    pub artifact_hash: String,
    /// Install time.
    pub installed_at: DateTime<Utc>,
}

/// A disagreement between the lockfile and the plugin root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// Locked but absent (or unreadable) on disk.
    Missing {
        /// Identity.
        plugin_id: PluginId,
    },
    /// Manifest version differs from the locked version.
    VersionMismatch {
        /// Identity.
        plugin_id: PluginId,
        /// Locked version.
        expected: String,
        /// Version on disk.
        actual: String,
    },
    /// Artifact digest differs from the locked digest.
    HashMismatch {
        /// Identity.
        plugin_id: PluginId,
        /// Locked digest.
        expected: String,
        /// Digest on disk.
        actual: String,
    },
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { plugin_id } => {
                write!(f, "{plugin_id} is locked but missing from disk")
            },
            Self::VersionMismatch {
                plugin_id,
                expected,
                actual,
            } => write!(
                f,
                "{plugin_id}: version mismatch (locked {expected}, found {actual})"
            ),
            Self::HashMismatch {
                plugin_id,
                expected,
                actual,
            } => write!(
                f,
                "{plugin_id}: artifact hash mismatch (locked {expected}, found {actual})"
            ),
        }
    }
}

impl Default for PluginLockfile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }
}

impl PluginLockfile {
    /// Load `path`, or an empty lockfile if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] if the file exists but is
    /// unreadable or malformed.
    pub fn load_or_default(path: &Path) -> PluginResult<Self> {
        let _guard = acquire_lock(path, LockMode::Shared)?;
        read_or_default(path)
    }

    /// Load, mutate and save under one exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] on IO or parse failure, or whatever
    /// `f` returns.
    pub fn update<F>(path: &Path, f: F) -> PluginResult<()>
    where
        F: FnOnce(&mut Self) -> PluginResult<()>,
    {
        let _guard = acquire_lock(path, LockMode::Exclusive)?;
        let mut lockfile = read_or_default(path)?;
        f(&mut lockfile)?;
        lockfile.write_atomic(path)
    }

    /// Insert or replace the entry for `entry.id`.
    pub fn upsert(&mut self, entry: LockedPlugin) {
        self.remove(&entry.id);
        self.entries.push(entry);
        self.entries.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// Drop the entry for `id`. Returns whether one existed.
    pub fn remove(&mut self, id: &PluginId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != *id);
        self.entries.len() < before
    }

    /// The entry for `id`.
    #[must_use]
    pub fn get(&self, id: &PluginId) -> Option<&LockedPlugin> {
        self.entries.iter().find(|e| e.id == *id)
    }

    /// All entries, sorted by identity.
    #[must_use]
    pub fn entries(&self) -> &[LockedPlugin] {
        &self.entries
    }

    /// Compare every entry with the files under `plugin_root`.
    #[must_use]
    pub fn verify_integrity(&self, plugin_root: &Path) -> Vec<IntegrityViolation> {
        let mut violations = Vec::new();
        for entry in &self.entries {
            let dir = plugin_root.join(entry.id.relative_path());
            let missing = || IntegrityViolation::Missing {
                plugin_id: entry.id.clone(),
            };

            let manifest = match PluginManifest::load_from_dir(&dir) {
                Ok(m) => m,
                Err(e) => {
                    debug!(plugin = %entry.id, error = %e, "locked plugin has no readable manifest");
                    violations.push(missing());
                    continue;
                },
            };
            if manifest.plugin.version != entry.version {
                violations.push(IntegrityViolation::VersionMismatch {
                    plugin_id: entry.id.clone(),
                    expected: entry.version.clone(),
                    actual: manifest.plugin.version.clone(),
                });
            }

            match integrity::artifact_hash(&dir.join(ARTIFACT_FILE_NAME)) {
                Ok(actual) if actual != entry.artifact_hash => {
                    violations.push(IntegrityViolation::HashMismatch {
                        plugin_id: entry.id.clone(),
                        expected: entry.artifact_hash.clone(),
                        actual,
                    });
                },
                Ok(_) => {},
                Err(e) => {
                    warn!(plugin = %entry.id, error = %e, "failed to hash artifact");
                    violations.push(missing());
                },
            }
        }
        violations
    }

    fn write_atomic(&self, path: &Path) -> PluginResult<()> {
        let lock_err = |message: String| PluginError::Lockfile {
            path: path.to_path_buf(),
            message,
        };

        let body = toml::to_string_pretty(self)
            .map_err(|e| lock_err(format!("failed to serialize: {e}")))?;
        let content = format!("# Generated by kiln. Do not edit.\n\n{body}");

        let parent = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| lock_err(format!("failed to create temp file: {e}")))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| lock_err(format!("failed to write temp file: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| lock_err(format!("failed to sync temp file: {e}")))?;
        tmp.persist(path)
            .map_err(|e| lock_err(format!("failed to replace lockfile: {e}")))?;

        debug!(path = %path.display(), entries = self.entries.len(), "saved lockfile");
        Ok(())
    }
}

impl LockedPlugin {
    /// Entry stamped with the current time.
    #[must_use]
    pub fn new(id: PluginId, version: String, source: Provenance, artifact_hash: String) -> Self {
        Self {
            id,
            version,
            source,
            artifact_hash,
            installed_at: Utc::now(),
        }
    }
}

fn read_or_default(path: &Path) -> PluginResult<PluginLockfile> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PluginLockfile::default()),
        Err(e) => {
            return Err(PluginError::Lockfile {
                path: path.to_path_buf(),
                message: format!("failed to read: {e}"),
            });
        },
    };
    let lockfile: PluginLockfile = toml::from_str(&content).map_err(|e| PluginError::Lockfile {
        path: path.to_path_buf(),
        message: format!("failed to parse: {e}"),
    })?;
    if lockfile.schema_version != SCHEMA_VERSION {
        warn!(
            path = %path.display(),
            found = lockfile.schema_version,
            expected = SCHEMA_VERSION,
            "lockfile schema version mismatch, loading best-effort"
        );
    }
    Ok(lockfile)
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on the `.lk` sibling. A shared lock on a lockfile that
/// was never written needs no coordination and returns `None`.
fn acquire_lock(path: &Path, mode: LockMode) -> PluginResult<Option<std::fs::File>> {
    let lock_path = path.with_extension("lk");
    let lock_err = |message: String| PluginError::Lockfile {
        path: path.to_path_buf(),
        message,
    };

    match mode {
        LockMode::Shared => match std::fs::File::open(&lock_path) {
            Ok(file) => {
                file.lock_shared()
                    .map_err(|e| lock_err(format!("failed to acquire shared lock: {e}")))?;
                Ok(Some(file))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(lock_err(format!("failed to open lock file: {e}"))),
        },
        LockMode::Exclusive => {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| lock_err(format!("failed to create directory: {e}")))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)
                .map_err(|e| lock_err(format!("failed to open lock file: {e}")))?;
            file.lock_exclusive()
                .map_err(|e| lock_err(format!("failed to acquire exclusive lock: {e}")))?;
            Ok(Some(file))
        },
    }
}
