//! Capability gates for sandbox host calls.
//!
//! Every capability a plugin reaches through its global API (`fetch`,
//! `fs`, `env`) is checked by a [`PluginSecurityGate`] before any side
//! effect happens. [`ManifestGate`] enforces the plugin's declared
//! [`PermissionSet`]; embedders can stack an extra gate on top of it
//! through [`LayeredGate`].

use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use url::Url;

use crate::error::{PluginError, PluginResult};
use crate::manifest::PermissionSet;

/// Security gate for sandbox host calls.
///
/// A denial is returned as a human-readable reason; the sandbox raises it
/// inside the plugin as a `PermissionDenied` error.
#[async_trait]
pub trait PluginSecurityGate: Send + Sync {
    /// May the plugin send `method` to `url`?
    async fn check_http_request(&self, plugin_id: &str, method: &str, url: &str)
    -> Result<(), String>;

    /// May the plugin read `path`?
    async fn check_file_read(&self, plugin_id: &str, path: &str) -> Result<(), String>;

    /// May the plugin write `path`?
    async fn check_file_write(&self, plugin_id: &str, path: &str) -> Result<(), String>;

    /// May the plugin read environment variable `name`?
    async fn check_env(&self, plugin_id: &str, name: &str) -> Result<(), String>;
}

/// Enforces a plugin's declared [`PermissionSet`].
#[derive(Debug, Clone)]
pub struct ManifestGate {
    hosts: Vec<HostPattern>,
    file_read: GlobSet,
    file_write: bool,
    env_vars: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    /// `example.com` matches itself and any subdomain.
    Domain(String),
    /// `*.example.com` matches subdomains only.
    Wildcard(String),
    /// `localhost:8080` matches that exact authority.
    Authority(String),
}

impl HostPattern {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if let Some(domain) = raw.strip_prefix("*.") {
            Self::Wildcard(domain.to_string())
        } else if raw.contains(':') {
            Self::Authority(raw)
        } else {
            Self::Domain(raw)
        }
    }

    fn matches(&self, host: &str, authority: &str) -> bool {
        match self {
            Self::Domain(d) => host == d || is_subdomain(host, d),
            Self::Wildcard(d) => is_subdomain(host, d),
            Self::Authority(a) => authority == a,
        }
    }
}

fn is_subdomain(host: &str, domain: &str) -> bool {
    host.len() > domain.len()
        && host.ends_with(domain)
        && host[..host.len().saturating_sub(domain.len())].ends_with('.')
}

impl ManifestGate {
    /// Compile the gate for `permissions`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestInvalid`] if a `file_read` glob does
    /// not compile.
    pub fn new(permissions: &PermissionSet) -> PluginResult<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &permissions.file_read {
            let glob = Glob::new(pattern).map_err(|e| PluginError::ManifestInvalid {
                path: crate::manifest::MANIFEST_FILE_NAME.into(),
                reason: format!("invalid file_read glob '{pattern}': {e}"),
            })?;
            builder.add(glob);
        }
        let file_read = builder.build().map_err(|e| PluginError::ManifestInvalid {
            path: crate::manifest::MANIFEST_FILE_NAME.into(),
            reason: format!("invalid file_read globs: {e}"),
        })?;

        Ok(Self {
            hosts: permissions
                .network
                .iter()
                .map(|h| HostPattern::parse(h))
                .collect(),
            file_read,
            file_write: permissions.file_write,
            env_vars: permissions.env_vars.iter().cloned().collect(),
        })
    }
}

fn reject_parent_components(path: &str) -> Result<(), String> {
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!("path '{path}' contains '..'"));
    }
    Ok(())
}

#[async_trait]
impl PluginSecurityGate for ManifestGate {
    async fn check_http_request(
        &self,
        plugin_id: &str,
        method: &str,
        url: &str,
    ) -> Result<(), String> {
        let parsed = Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("scheme '{}' is not allowed", parsed.scheme()));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| format!("URL '{url}' has no host"))?
            .trim_end_matches('.')
            .to_ascii_lowercase();
        let authority = match parsed.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        if self.hosts.iter().any(|p| p.matches(&host, &authority)) {
            Ok(())
        } else {
            Err(format!(
                "plugin '{plugin_id}' may not {method} {host}: host is not in permissions.network"
            ))
        }
    }

    async fn check_file_read(&self, plugin_id: &str, path: &str) -> Result<(), String> {
        reject_parent_components(path)?;
        if !self.file_read.is_match(path) {
            return Err(format!(
                "plugin '{plugin_id}' may not read '{path}': no permissions.file_read glob matches"
            ));
        }
        // A symlink must not launder an allowed name into a forbidden target.
        if let Ok(real) = std::fs::canonicalize(path)
            && !self.file_read.is_match(&real)
        {
            return Err(format!(
                "plugin '{plugin_id}' may not read '{path}': resolves to '{}'",
                real.display()
            ));
        }
        Ok(())
    }

    async fn check_file_write(&self, plugin_id: &str, path: &str) -> Result<(), String> {
        if !self.file_write {
            return Err(format!(
                "plugin '{plugin_id}' may not write '{path}': permissions.file_write is false"
            ));
        }
        reject_parent_components(path)
    }

    async fn check_env(&self, plugin_id: &str, name: &str) -> Result<(), String> {
        if self.env_vars.contains(name) {
            Ok(())
        } else {
            Err(format!(
                "plugin '{plugin_id}' may not read environment variable '{name}'"
            ))
        }
    }
}

/// Both gates must allow; the first denial wins.
#[derive(Clone)]
pub struct LayeredGate {
    inner: Arc<dyn PluginSecurityGate>,
    outer: Arc<dyn PluginSecurityGate>,
}

impl LayeredGate {
    /// Check `inner` first, then `outer`.
    #[must_use]
    pub fn new(inner: Arc<dyn PluginSecurityGate>, outer: Arc<dyn PluginSecurityGate>) -> Self {
        Self { inner, outer }
    }
}

impl std::fmt::Debug for LayeredGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredGate").finish_non_exhaustive()
    }
}

#[async_trait]
impl PluginSecurityGate for LayeredGate {
    async fn check_http_request(
        &self,
        plugin_id: &str,
        method: &str,
        url: &str,
    ) -> Result<(), String> {
        self.inner.check_http_request(plugin_id, method, url).await?;
        self.outer.check_http_request(plugin_id, method, url).await
    }

    async fn check_file_read(&self, plugin_id: &str, path: &str) -> Result<(), String> {
        self.inner.check_file_read(plugin_id, path).await?;
        self.outer.check_file_read(plugin_id, path).await
    }

    async fn check_file_write(&self, plugin_id: &str, path: &str) -> Result<(), String> {
        self.inner.check_file_write(plugin_id, path).await?;
        self.outer.check_file_write(plugin_id, path).await
    }

    async fn check_env(&self, plugin_id: &str, name: &str) -> Result<(), String> {
        self.inner.check_env(plugin_id, name).await?;
        self.outer.check_env(plugin_id, name).await
    }
}

/// Gate that denies everything, for embedders running plugins fully
/// offline regardless of what they declare.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllGate;

#[async_trait]
impl PluginSecurityGate for DenyAllGate {
    async fn check_http_request(
        &self,
        plugin_id: &str,
        method: &str,
        url: &str,
    ) -> Result<(), String> {
        Err(format!("plugin '{plugin_id}' denied: {method} {url} (host policy)"))
    }

    async fn check_file_read(&self, plugin_id: &str, path: &str) -> Result<(), String> {
        Err(format!("plugin '{plugin_id}' denied: read {path} (host policy)"))
    }

    async fn check_file_write(&self, plugin_id: &str, path: &str) -> Result<(), String> {
        Err(format!("plugin '{plugin_id}' denied: write {path} (host policy)"))
    }

    async fn check_env(&self, plugin_id: &str, name: &str) -> Result<(), String> {
        Err(format!("plugin '{plugin_id}' denied: env {name} (host policy)"))
    }
}
