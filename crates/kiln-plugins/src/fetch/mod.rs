//! Materializing plugin sources into a staging directory.
//!
//! Every [`FetchPlan`] ends as a [`StagedSource`]: a private temporary
//! directory holding the plugin's files plus a [`Provenance`] record. The
//! staging directory is removed when the `StagedSource` is dropped.
//! Registry and repository sources that declare dependencies get them
//! installed with `npm` before they are handed on.

mod archive;
mod git;
mod local;
mod npm;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

pub use archive::{extract_bundle, extract_tar_gz, extract_zip, is_gzip, is_zip};

use crate::error::{PluginError, PluginResult};
use crate::integrity;
use crate::registry::RegistryClient;
use crate::source::FetchPlan;

/// Where an installed plugin came from, resolved to an exact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Provenance {
    /// Downloaded from the registry.
    Registry {
        /// Registry name.
        name: String,
        /// Exact version downloaded.
        version: String,
    },
    /// Cloned from a repository.
    Git {
        /// Clone URL.
        url: String,
        /// Commit checked out, if known.
        commit: Option<String>,
    },
    /// Copied from a local directory.
    Local {
        /// Canonical source path.
        path: String,
    },
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { name, version } => write!(f, "registry:{name}@{version}"),
            Self::Git { url, commit: None } => write!(f, "git:{url}"),
            Self::Git {
                url,
                commit: Some(c),
            } => write!(f, "git:{url}#{c}"),
            Self::Local { path } => write!(f, "local:{path}"),
        }
    }
}

impl From<Provenance> for String {
    fn from(p: Provenance) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for Provenance {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid provenance: {s}"))
    }
}

impl Provenance {
    /// Parse the `kind:value` string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, value) = s.split_once(':')?;
        match kind {
            "registry" => {
                let skip = usize::from(value.starts_with('@'));
                let at = value[skip..].rfind('@')?.saturating_add(skip);
                let (name, version) = (&value[..at], &value[at.saturating_add(1)..]);
                if name.is_empty() || version.is_empty() {
                    return None;
                }
                Some(Self::Registry {
                    name: name.to_string(),
                    version: version.to_string(),
                })
            },
            "git" => Some(match value.rsplit_once('#') {
                Some((url, commit)) => Self::Git {
                    url: url.to_string(),
                    commit: Some(commit.to_string()),
                },
                None => Self::Git {
                    url: value.to_string(),
                    commit: None,
                },
            }),
            "local" => Some(Self::Local {
                path: value.to_string(),
            }),
            _ => None,
        }
    }
}

/// Plugin files staged for validation and build.
#[derive(Debug)]
pub struct StagedSource {
    _staging: TempDir,
    root: PathBuf,
    provenance: Provenance,
    checksum: Option<String>,
    node_modules: Option<PathBuf>,
}

impl StagedSource {
    /// Directory holding `plugin.toml`.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the files came from.
    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Verified SHA-256 of the downloaded bundle (registry sources only).
    #[must_use]
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Where the bundler resolves dependencies from: `node_modules` left
    /// at a local source's original location, or the one npm installed
    /// into a fetched source.
    #[must_use]
    pub fn node_modules(&self) -> Option<&Path> {
        self.node_modules.as_deref()
    }
}

/// Runs a [`FetchPlan`].
#[derive(Debug, Clone)]
pub struct Fetcher {
    registry: RegistryClient,
    npm: Option<PathBuf>,
}

impl Fetcher {
    /// Create a fetcher that downloads registry sources through `registry`.
    #[must_use]
    pub fn new(registry: RegistryClient) -> Self {
        Self {
            registry,
            npm: None,
        }
    }

    /// Use this `npm` binary instead of looking it up on `PATH`.
    #[must_use]
    pub fn with_npm(mut self, npm: Option<PathBuf>) -> Self {
        self.npm = npm;
        self
    }

    /// The registry client in use.
    #[must_use]
    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    /// Materialize `plan` into a fresh staging directory.
    ///
    /// # Errors
    ///
    /// - [`PluginError::SourceNotFound`] for a missing local path or manifest
    /// - [`PluginError::ChecksumMismatch`] when a download fails verification
    /// - [`PluginError::FetchFailed`] for network, clone or archive failures
    /// - [`PluginError::BundleFailed`] when declared dependencies cannot be
    ///   installed
    pub async fn fetch(&self, plan: &FetchPlan) -> PluginResult<StagedSource> {
        let staging = tempfile::Builder::new()
            .prefix("kiln-fetch-")
            .tempdir()
            .map_err(|e| PluginError::io("failed to create staging dir", e))?;

        let staged = match plan {
            FetchPlan::Registry { id, version } => {
                let meta = self.registry.get(id.as_str(), version.as_deref()).await?;
                let bytes = self.registry.download(&meta).await?;
                let label = format!("{}@{}", meta.name, meta.version);
                let checksum = integrity::verify_sha256(&label, &bytes, meta.sha256.as_deref())?;
                debug!(plugin = %label, bytes = bytes.len(), "checksum verified");

                let dest = staging.path().to_path_buf();
                let extract_label = label.clone();
                let root = tokio::task::spawn_blocking(move || {
                    extract_bundle(&extract_label, &bytes, &dest)
                })
                .await
                .map_err(|e| PluginError::FetchFailed {
                    source_desc: label.clone(),
                    message: format!("extraction task failed: {e}"),
                })??;
                let node_modules =
                    npm::install_dependencies(&label, &root, self.npm.as_deref()).await?;

                StagedSource {
                    _staging: staging,
                    root,
                    provenance: Provenance::Registry {
                        name: meta.name,
                        version: meta.version,
                    },
                    checksum: Some(checksum),
                    node_modules,
                }
            },
            FetchPlan::Git { url, reference } => {
                let (root, commit) = git::clone(url, reference.as_deref(), staging.path()).await?;
                let node_modules =
                    npm::install_dependencies(url, &root, self.npm.as_deref()).await?;
                StagedSource {
                    _staging: staging,
                    root,
                    provenance: Provenance::Git {
                        url: url.clone(),
                        commit: Some(commit),
                    },
                    checksum: None,
                    node_modules,
                }
            },
            FetchPlan::Local { path } => {
                let source = local::locate(path)?;
                let dest = staging.path().join("src");
                let src = source.clone();
                let copy_dest = dest.clone();
                tokio::task::spawn_blocking(move || local::copy_tree(&src, &copy_dest))
                    .await
                    .map_err(|e| PluginError::FetchFailed {
                        source_desc: path.display().to_string(),
                        message: format!("copy task failed: {e}"),
                    })??;
                let node_modules = Some(source.join("node_modules")).filter(|p| p.is_dir());
                StagedSource {
                    _staging: staging,
                    root: dest,
                    provenance: Provenance::Local {
                        path: source.display().to_string(),
                    },
                    checksum: None,
                    node_modules,
                }
            },
        };

        info!(source = %plan, provenance = %staged.provenance, "source staged");
        Ok(staged)
    }
}
