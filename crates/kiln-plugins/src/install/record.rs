//! Per-install record (`.kiln-install.toml`).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::fetch::Provenance;
use crate::plugin::PluginId;

/// File name of the install record inside each plugin directory.
pub const INSTALL_RECORD_FILE: &str = ".kiln-install.toml";

/// How and when a plugin directory was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    /// Identity.
    pub id: PluginId,
    /// Manifest version.
    pub version: String,
    /// Install time.
    pub installed_at: DateTime<Utc>,
    /// Resolved source.
    pub source: Provenance,
    /// Verified SHA-256 of the registry download, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// `blake3:` digest of the artifact.
    pub artifact_hash: String,
    /// Whether the TypeScript transform ran.
    #[serde(default)]
    pub transformed: bool,
    /// Whether the bundler ran.
    #[serde(default)]
    pub bundled: bool,
}

impl InstallRecord {
    /// Read the record in `dir`. `Ok(None)` if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] or [`PluginError::ManifestInvalid`] if
    /// the record exists but cannot be read or parsed.
    pub fn load(dir: &Path) -> PluginResult<Option<Self>> {
        let path = dir.join(INSTALL_RECORD_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PluginError::io(format!("failed to read {}", path.display()), e)),
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| PluginError::ManifestInvalid {
                path,
                reason: format!("malformed install record: {e}"),
            })
    }

    /// Write the record into `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] on write failure.
    pub fn write(&self, dir: &Path) -> PluginResult<()> {
        let path = dir.join(INSTALL_RECORD_FILE);
        let body = toml::to_string_pretty(self).map_err(|e| {
            PluginError::io(
                format!("failed to serialize {}", path.display()),
                std::io::Error::other(e),
            )
        })?;
        std::fs::write(&path, body)
            .map_err(|e| PluginError::io(format!("failed to write {}", path.display()), e))
    }
}
