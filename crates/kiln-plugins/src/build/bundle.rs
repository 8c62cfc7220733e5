//! `esbuild` invocation for dependency bundling.
//!
//! The bundle is an IIFE whose exports land on a private global and are
//! then copied onto `globalThis`, so the artifact behaves like a
//! transformed script.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{PluginError, PluginResult};

/// Global the IIFE assigns its exports to.
const BUNDLE_GLOBAL: &str = "__kiln_exports";

/// esbuild knobs.
#[derive(Debug, Clone)]
pub(crate) struct BundleRequest<'a> {
    pub(crate) entry: &'a Path,
    pub(crate) esbuild: Option<&'a Path>,
    pub(crate) target: &'a str,
    pub(crate) minify: bool,
    pub(crate) node_modules: Option<&'a Path>,
}

/// Find the esbuild binary: explicit path first, then `PATH`.
pub(crate) fn locate_esbuild(explicit: Option<&Path>) -> PluginResult<PathBuf> {
    match explicit {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(PluginError::BundleFailed(format!(
            "configured esbuild not found at {}",
            path.display()
        ))),
        None => which::which("esbuild").map_err(|_| {
            PluginError::BundleFailed(
                "esbuild not found in PATH (install with `npm i -g esbuild`)".into(),
            )
        }),
    }
}

/// Bundle `req.entry` and return the artifact source.
pub(crate) fn bundle(req: &BundleRequest<'_>) -> PluginResult<String> {
    let esbuild = locate_esbuild(req.esbuild)?;
    let out_dir = tempfile::Builder::new()
        .prefix("kiln-bundle-")
        .tempdir()
        .map_err(|e| PluginError::io("failed to create bundle dir", e))?;
    let outfile = out_dir.path().join("bundle.js");

    let mut cmd = Command::new(&esbuild);
    cmd.arg(req.entry)
        .arg("--bundle")
        .arg("--format=iife")
        .arg(format!("--global-name={BUNDLE_GLOBAL}"))
        .arg(format!("--target={}", req.target))
        .arg("--platform=neutral")
        .arg("--main-fields=module,main")
        .arg("--log-level=error")
        .arg(format!(
            "--footer:js=if (typeof {BUNDLE_GLOBAL} === \"object\" && {BUNDLE_GLOBAL}) \
             Object.assign(globalThis, {BUNDLE_GLOBAL});"
        ))
        .arg(format!("--outfile={}", outfile.display()))
        .stdin(Stdio::null());
    if req.minify {
        cmd.arg("--minify");
    }
    if let Some(dir) = req.entry.parent() {
        cmd.current_dir(dir);
    }
    if let Some(modules) = req.node_modules {
        cmd.env("NODE_PATH", modules);
    }

    debug!(esbuild = %esbuild.display(), entry = %req.entry.display(), "bundling");
    let output = cmd
        .output()
        .map_err(|e| PluginError::BundleFailed(format!("failed to run esbuild: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PluginError::BundleFailed(format!(
            "esbuild exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    std::fs::read_to_string(&outfile)
        .map_err(|e| PluginError::BundleFailed(format!("failed to read esbuild output: {e}")))
}
