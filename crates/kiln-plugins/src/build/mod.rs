//! Build pipeline: staged source → single-file artifact.
//!
//! | Entry | Dependencies | Result |
//! |-------|--------------|--------|
//! | `.js` | none | transformed (exports exposed) or copied verbatim |
//! | `.ts` | none | OXC transform |
//! | any   | declared | OXC check, then esbuild bundle |
//!
//! Dependencies are declared either in `[runtime] dependencies` or in a
//! `package.json` `dependencies` table next to the manifest.

mod bundle;
mod transform;

use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub use transform::{Transformed, transform};

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::validate::entry_path;

/// File name of the built artifact inside an install directory.
pub const ARTIFACT_FILE_NAME: &str = "index.js";

/// File name of the artifact's source map, when the build produced one.
pub const SOURCE_MAP_FILE_NAME: &str = "index.js.map";

/// Per-build switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Run the TypeScript transform.
    pub transpile: bool,
    /// Run the bundler when dependencies are declared.
    pub bundle: bool,
    /// Explicit esbuild binary; otherwise looked up on `PATH`.
    pub esbuild: Option<PathBuf>,
    /// esbuild `--target`.
    pub target: String,
    /// esbuild `--minify`.
    pub minify: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            transpile: true,
            bundle: true,
            esbuild: None,
            target: "es2020".into(),
            minify: false,
        }
    }
}

impl BuildOptions {
    /// Narrow these options by per-install flags. A stage disabled here
    /// (for instance by a process-wide kill-switch) stays disabled.
    #[must_use]
    pub fn restrict(mut self, transpile: bool, bundle: bool) -> Self {
        self.transpile &= transpile;
        self.bundle &= bundle;
        self
    }
}

/// A built artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Artifact source, written as [`ARTIFACT_FILE_NAME`].
    pub code: String,
    /// Whether the TypeScript transform ran.
    pub transformed: bool,
    /// Whether esbuild ran.
    pub bundled: bool,
    /// Map from the artifact back to the plugin's entry file, written as
    /// [`SOURCE_MAP_FILE_NAME`]. Only transformed, unbundled builds have one.
    pub source_map: Option<String>,
}

/// Build the artifact for a validated plugin in `root`.
///
/// Blocking: may spawn esbuild.
///
/// # Errors
///
/// - [`PluginError::TransformFailed`] for transform diagnostics, a TypeScript
///   entry with the transform disabled, or unbundled runtime imports
/// - [`PluginError::BundleFailed`] when dependencies need bundling and the
///   bundler is disabled, missing, or fails
pub fn build(
    root: &Path,
    manifest: &PluginManifest,
    options: &BuildOptions,
    node_modules: Option<&Path>,
) -> PluginResult<BuildOutput> {
    let entry = entry_path(root, &manifest.runtime.entry).map_err(|reason| {
        PluginError::ManifestInvalid {
            path: root.join(crate::manifest::MANIFEST_FILE_NAME),
            reason,
        }
    })?;
    let is_ts = manifest.entry_is_typescript();

    if is_ts && !options.transpile {
        return Err(PluginError::TransformFailed {
            file: entry,
            diagnostics: "TypeScript entry requires the transform stage, which is disabled".into(),
        });
    }

    let dependencies = declared_dependencies(root, manifest)?;
    let needs_bundle = !dependencies.is_empty();
    if needs_bundle && !options.bundle {
        return Err(PluginError::BundleFailed(format!(
            "plugin declares dependencies ({}) but bundling is disabled",
            dependencies.join(", ")
        )));
    }

    let source = std::fs::read_to_string(&entry)
        .map_err(|e| PluginError::io(format!("failed to read {}", entry.display()), e))?;

    if needs_bundle {
        if options.transpile {
            // Surface OXC diagnostics before handing off to esbuild.
            transform(&source, &entry)?;
        }
        let code = bundle::bundle(&bundle::BundleRequest {
            entry: &entry,
            esbuild: options.esbuild.as_deref(),
            target: &options.target,
            minify: options.minify,
            node_modules,
        })?;
        info!(entry = %manifest.runtime.entry, deps = dependencies.len(), "bundled artifact");
        return Ok(BuildOutput {
            code,
            transformed: options.transpile,
            bundled: true,
            source_map: None,
        });
    }

    if !options.transpile {
        debug!(entry = %manifest.runtime.entry, "transform disabled, copying entry verbatim");
        return Ok(BuildOutput {
            code: source,
            transformed: false,
            bundled: false,
            source_map: None,
        });
    }

    let out = transform(&source, &entry)?;
    if !out.imports.is_empty() {
        return Err(PluginError::TransformFailed {
            file: entry,
            diagnostics: format!(
                "runtime imports need bundling: [{}]; declare them under [runtime] dependencies",
                out.imports.join(", ")
            ),
        });
    }
    debug!(entry = %manifest.runtime.entry, typescript = is_ts, "transformed artifact");
    Ok(BuildOutput {
        code: out.code,
        transformed: true,
        bundled: false,
        source_map: out
            .source_map
            .and_then(|json| relabel(&json, &manifest.runtime.entry)),
    })
}

/// Point the map's single source at the manifest's entry path, so remapped
/// frames read the way the plugin author wrote the file name.
fn relabel(map_json: &str, entry: &str) -> Option<String> {
    match oxc_sourcemap::SourceMap::from_json_string(map_json) {
        Ok(mut map) => {
            map.set_sources([entry]);
            Some(map.to_json_string())
        },
        Err(e) => {
            debug!(entry, error = %e, "discarding unreadable source map");
            None
        },
    }
}

/// Dependencies from the manifest plus `package.json`, sorted and deduped.
pub(crate) fn declared_dependencies(root: &Path, manifest: &PluginManifest) -> PluginResult<Vec<String>> {
    let mut deps = manifest.runtime.dependencies.clone();

    let package_json = root.join("package.json");
    match std::fs::read_to_string(&package_json) {
        Ok(content) => {
            let value: serde_json::Value =
                serde_json::from_str(&content).map_err(|e| PluginError::ManifestInvalid {
                    path: package_json.clone(),
                    reason: format!("invalid package.json: {e}"),
                })?;
            if let Some(table) = value.get("dependencies").and_then(|d| d.as_object()) {
                deps.extend(table.keys().cloned());
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

    deps.sort();
    deps.dedup();
    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(entry: &str, source: &str, extra_manifest: &str) -> (tempfile::TempDir, PluginManifest) {
        let dir = tempfile::tempdir().unwrap();
        let manifest = format!(
            "[plugin]\nname = \"t\"\nversion = \"1.0.0\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"{entry}\"\n{extra_manifest}"
        );
        std::fs::write(dir.path().join("plugin.toml"), &manifest).unwrap();
        std::fs::write(dir.path().join(entry), source).unwrap();
        let m = PluginManifest::load_from_dir(dir.path()).unwrap();
        (dir, m)
    }

    #[test]
    fn typescript_entry_is_transformed() {
        let (dir, m) = stage(
            "index.ts",
            "export function __tool_hello(a: { name: string }) { return `Hello, ${a.name}!`; }\n",
            "",
        );
        let out = build(dir.path(), &m, &BuildOptions::default(), None).unwrap();
        assert!(out.transformed);
        assert!(!out.bundled);
        assert!(out.code.contains("globalThis.__tool_hello = __tool_hello;"));
    }

    #[test]
    fn typescript_entry_with_transform_disabled_fails() {
        let (dir, m) = stage("index.ts", "const x: number = 1;\n", "");
        let opts = BuildOptions::default().restrict(false, true);
        let err = build(dir.path(), &m, &opts, None).unwrap_err();
        assert!(matches!(err, PluginError::TransformFailed { .. }));
    }

    #[test]
    fn javascript_with_transform_disabled_is_copied() {
        let src = "function __tool_x() { return 'x'; }\n";
        let (dir, m) = stage("index.js", src, "");
        let opts = BuildOptions::default().restrict(false, false);
        let out = build(dir.path(), &m, &opts, None).unwrap();
        assert_eq!(out.code, src);
        assert!(out.source_map.is_none());
    }

    #[test]
    fn transformed_builds_carry_a_map_of_the_entry() {
        let (dir, m) = stage("index.ts", "export const f = (n: number) => n + 1;\n", "");
        let out = build(dir.path(), &m, &BuildOptions::default(), None).unwrap();
        let map = oxc_sourcemap::SourceMap::from_json_string(&out.source_map.unwrap()).unwrap();
        let sources: Vec<_> = map.get_sources().map(ToString::to_string).collect();
        assert_eq!(sources, vec!["index.ts".to_string()]);
    }

    #[test]
    fn declared_dependency_with_bundle_disabled_fails() {
        let (dir, m) = stage("index.js", "import x from 'lodash';\n", "dependencies = [\"lodash\"]\n");
        let opts = BuildOptions::default().restrict(true, false);
        let err = build(dir.path(), &m, &opts, None).unwrap_err();
        assert!(matches!(err, PluginError::BundleFailed(_)));
    }

    #[test]
    fn package_json_dependencies_count() {
        let (dir, m) = stage("index.js", "1;\n", "dependencies = [\"b\"]\n");
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies":{"a":"^1","b":"^2"}}"#,
        )
        .unwrap();
        assert_eq!(declared_dependencies(dir.path(), &m).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn undeclared_import_is_rejected() {
        let (dir, m) = stage("index.js", "import x from 'lodash';\nx();\n", "");
        let err = build(dir.path(), &m, &BuildOptions::default(), None).unwrap_err();
        assert!(err.to_string().contains("runtime imports need bundling"));
    }

    #[test]
    fn missing_bundler_is_bundle_failure() {
        let (dir, m) = stage("index.js", "import x from 'lodash';\n", "dependencies = [\"lodash\"]\n");
        let opts = BuildOptions {
            esbuild: Some(PathBuf::from("/nonexistent/esbuild")),
            ..BuildOptions::default()
        };
        let err = build(dir.path(), &m, &opts, None).unwrap_err();
        assert!(matches!(err, PluginError::BundleFailed(_)));
    }

    #[test]
    fn same_input_same_output() {
        let (dir, m) = stage("index.ts", "export const f = (n: number) => n + 1;\n", "");
        let a = build(dir.path(), &m, &BuildOptions::default(), None).unwrap();
        let b = build(dir.path(), &m, &BuildOptions::default(), None).unwrap();
        assert_eq!(a, b);
    }
}
