//! Dependency installation for fetched plugins.
//!
//! Registry bundles and repository checkouts arrive without
//! `node_modules`. When the plugin declares dependencies, `npm` installs
//! the production set into the staged root so the bundler can resolve
//! them. Package lifecycle scripts never run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;

/// Upper bound on one `npm install`.
pub(crate) const NPM_TIMEOUT: Duration = Duration::from_secs(300);

/// What to ask npm for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Install {
    /// `package.json` lists dependencies.
    PackageJson,
    /// Only `[runtime] dependencies` in the manifest names them.
    Named(Vec<String>),
}

/// Decide whether `root` needs an install. A staged `node_modules` or an
/// unreadable manifest means no; validation reports the latter.
pub(crate) fn plan(root: &Path) -> PluginResult<Option<Install>> {
    if root.join("node_modules").is_dir() {
        return Ok(None);
    }

    let package_json = root.join("package.json");
    match std::fs::read_to_string(&package_json) {
        Ok(content) => {
            let value: serde_json::Value =
                serde_json::from_str(&content).map_err(|e| PluginError::ManifestInvalid {
                    path: package_json.clone(),
                    reason: format!("invalid package.json: {e}"),
                })?;
            let listed = value
                .get("dependencies")
                .and_then(|d| d.as_object())
                .is_some_and(|d| !d.is_empty());
            if listed {
                return Ok(Some(Install::PackageJson));
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => {
            return Err(PluginError::io(
                format!("failed to read {}", package_json.display()),
                e,
            ));
        },
    }

    let Ok(manifest) = PluginManifest::load_from_dir(root) else {
        return Ok(None);
    };
    let named = manifest.runtime.dependencies;
    Ok((!named.is_empty()).then_some(Install::Named(named)))
}

/// Find npm: explicit path first, then `PATH`.
pub(crate) fn locate_npm(explicit: Option<&Path>) -> PluginResult<PathBuf> {
    match explicit {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(PluginError::BundleFailed(format!(
            "configured npm not found at {}",
            path.display()
        ))),
        None => which::which("npm").map_err(|_| {
            PluginError::BundleFailed(
                "plugin declares dependencies but npm was not found in PATH".into(),
            )
        }),
    }
}

/// Install dependencies into `root` if it declares any, returning the
/// resulting `node_modules`.
pub(super) async fn install_dependencies(
    label: &str,
    root: &Path,
    npm: Option<&Path>,
) -> PluginResult<Option<PathBuf>> {
    let staged = root.to_path_buf();
    let planned = tokio::task::spawn_blocking(move || plan(&staged))
        .await
        .map_err(|e| PluginError::BundleFailed(format!("dependency scan failed: {e}")))?;
    let Some(install) = planned? else {
        return Ok(None);
    };
    let npm = locate_npm(npm)?;

    let mut cmd = Command::new(&npm);
    cmd.arg("install")
        .arg("--production")
        .arg("--ignore-scripts")
        .arg("--no-audit")
        .arg("--no-fund");
    if let Install::Named(deps) = &install {
        cmd.arg("--no-save").arg("--").args(deps);
    }
    cmd.current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(plugin = label, npm = %npm.display(), ?install, "installing dependencies");
    let output = tokio::time::timeout(NPM_TIMEOUT, cmd.output())
        .await
        .map_err(|_| {
            PluginError::BundleFailed(format!(
                "npm install for {label} timed out after {}s",
                NPM_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| PluginError::BundleFailed(format!("failed to run npm: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PluginError::BundleFailed(format!(
            "npm install for {label} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let modules = root.join("node_modules");
    info!(plugin = label, "dependencies installed");
    Ok(Some(modules).filter(|m| m.is_dir()))
}
