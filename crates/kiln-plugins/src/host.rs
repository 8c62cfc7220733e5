//! The plugin host: install pipeline plus execution entry points.
//!
//! ```text
//! install(source) → resolve → fetch → validate → build → lock → stage → commit
//! invoke(name, …) → load → sandbox engine
//! ```

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use kiln_storage::KvStore;
use serde_json::Value;
use tracing::{info, warn};

use crate::build::{self, ARTIFACT_FILE_NAME, BuildOptions, BuildOutput, SOURCE_MAP_FILE_NAME};
use crate::error::{PluginError, PluginResult};
use crate::fetch::{Fetcher, StagedSource};
use crate::install::{InstallRecord, InstalledPlugin, PluginStore};
use crate::lockfile::IntegrityViolation;
use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest};
use crate::plugin::PluginId;
use crate::registry::SearchResult;
use crate::sandbox::{ExecutionContext, LoadedPlugin, SandboxEngine, SkillResult, ToolResult};
use crate::source;
use crate::validate;

/// Per-install switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Allow the TypeScript transform.
    pub transpile: bool,
    /// Allow dependency bundling.
    pub bundle: bool,
    /// Version pin for registry sources.
    pub version: Option<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            transpile: true,
            bundle: true,
            version: None,
        }
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// The installed plugin.
    pub plugin: InstalledPlugin,
    /// Whether a registry checksum was verified.
    pub checksum_verified: bool,
    /// Whether the TypeScript transform ran.
    pub transformed: bool,
    /// Whether the bundler ran.
    pub bundled: bool,
    /// Whether a previous install was replaced.
    pub replaced: bool,
}

/// Installs, lists, removes and runs plugins in one plugin root.
pub struct PluginHost {
    store: PluginStore,
    fetcher: Fetcher,
    build: BuildOptions,
    engine: SandboxEngine,
    memory: Arc<dyn KvStore>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("root", &self.store.root())
            .field("build", &self.build)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    /// Assemble a host. `memory` must be the store the engine was built with.
    #[must_use]
    pub fn new(
        store: PluginStore,
        fetcher: Fetcher,
        build: BuildOptions,
        engine: SandboxEngine,
        memory: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            store,
            fetcher,
            build,
            engine,
            memory,
        }
    }

    /// The plugin store.
    #[must_use]
    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    /// The sandbox engine.
    #[must_use]
    pub fn engine(&self) -> &SandboxEngine {
        &self.engine
    }

    /// Install from a registry name, repository URL or local path.
    ///
    /// Nothing is written to the plugin root until the artifact has been
    /// built; a failure at any stage leaves a previous install untouched.
    ///
    /// # Errors
    ///
    /// Any error from resolution, fetching, validation, building or
    /// committing, unchanged.
    pub async fn install(
        &self,
        source_input: &str,
        options: &InstallOptions,
    ) -> PluginResult<InstallReport> {
        let plan = source::resolve(source_input, options.version.as_deref())?;
        info!(source = %plan, kind = plan.kind(), "Installing plugin");

        let staged = self.fetcher.fetch(&plan).await?;
        let build_options = self
            .build
            .clone()
            .restrict(options.transpile, options.bundle);
        let (manifest, output) = validate_and_build(&staged, build_options).await?;
        let id = manifest.id()?;

        let guard = self.store.lock(&id).await?;
        let record = InstallRecord {
            id: id.clone(),
            version: manifest.plugin.version.clone(),
            installed_at: Utc::now(),
            source: staged.provenance().clone(),
            checksum: staged.checksum().map(str::to_string),
            artifact_hash: crate::integrity::artifact_digest(output.code.as_bytes()),
            transformed: output.transformed,
            bundled: output.bundled,
        };

        let store = self.store.clone();
        let manifest_src = staged.root().join(MANIFEST_FILE_NAME);
        let artifact = output.code;
        let source_map = output.source_map;
        let (plugin, replaced) = tokio::task::spawn_blocking(move || {
            let replaced = store.plugin_dir(&record.id).exists();
            let staging = store.staging_dir()?;
            std::fs::copy(&manifest_src, staging.path().join(MANIFEST_FILE_NAME)).map_err(|e| {
                PluginError::io(format!("failed to copy {}", manifest_src.display()), e)
            })?;
            std::fs::write(staging.path().join(ARTIFACT_FILE_NAME), &artifact)
                .map_err(|e| PluginError::io("failed to write artifact", e))?;
            if let Some(map) = &source_map {
                std::fs::write(staging.path().join(SOURCE_MAP_FILE_NAME), map)
                    .map_err(|e| PluginError::io("failed to write source map", e))?;
            }
            let committed = store.commit(&guard, staging, &record);
            drop(guard);
            committed.map(|plugin| (plugin, replaced))
        })
        .await
        .map_err(join_error)??;

        self.engine.invalidate(&id).await;
        info!(
            plugin = %id,
            version = %plugin.manifest.plugin.version,
            checksum_verified = staged.checksum().is_some(),
            "Plugin installed"
        );

        Ok(InstallReport {
            checksum_verified: staged.checksum().is_some(),
            transformed: output.transformed,
            bundled: output.bundled,
            replaced,
            plugin,
        })
    }

    /// Every installed plugin, sorted by identity.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the plugin root is unreadable.
    pub async fn list(&self) -> PluginResult<Vec<InstalledPlugin>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list())
            .await
            .map_err(join_error)?
    }

    /// One installed plugin.
    ///
    /// # Errors
    ///
    /// [`PluginError::InvalidId`] or [`PluginError::PluginNotFound`].
    pub async fn get(&self, name: &str) -> PluginResult<InstalledPlugin> {
        let id = PluginId::new(name)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get(&id))
            .await
            .map_err(join_error)?
    }

    /// Remove a plugin and purge everything it stored in memory.
    ///
    /// # Errors
    ///
    /// [`PluginError::PluginNotFound`] if it is not installed in the
    /// writable root, or a storage error while purging.
    pub async fn remove(&self, name: &str) -> PluginResult<InstalledPlugin> {
        let id = PluginId::new(name)?;
        let guard = self.store.lock(&id).await?;

        let store = self.store.clone();
        let (removed, guard) = tokio::task::spawn_blocking(move || {
            let removed = store.remove(&guard);
            (removed, guard)
        })
        .await
        .map_err(join_error)?;
        let removed = removed?;

        let retirement = self.engine.retire(&id).await;
        let purged = self.memory.clear_namespace(&id.memory_namespace()).await?;
        drop(retirement);
        drop(guard);
        info!(plugin = %id, purged, "Plugin memory purged");
        Ok(removed)
    }

    /// Lockfile integrity violations in the writable root.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] if the lockfile is unreadable.
    pub async fn verify(&self) -> PluginResult<Vec<IntegrityViolation>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.verify())
            .await
            .map_err(join_error)?
    }

    /// Load an installed plugin for execution.
    ///
    /// # Errors
    ///
    /// [`PluginError::PluginNotFound`] or a read error.
    pub async fn load(&self, name: &str) -> PluginResult<LoadedPlugin> {
        let id = PluginId::new(name)?;
        let store = self.store.clone();
        let (installed, loaded) = tokio::task::spawn_blocking(move || {
            store.read(&id, |installed| {
                Ok((installed.clone(), LoadedPlugin::load(&installed.path)?))
            })
        })
        .await
        .map_err(join_error)??;
        if loaded.digest != installed.artifact_hash {
            warn!(
                plugin = %loaded.id,
                recorded = %installed.artifact_hash,
                actual = %loaded.digest,
                "Artifact differs from its install record"
            );
        }
        Ok(loaded)
    }

    /// Call a tool of an installed plugin.
    ///
    /// # Errors
    ///
    /// See [`SandboxEngine::execute_tool`].
    pub async fn invoke_tool(
        &self,
        name: &str,
        tool: &str,
        args: Value,
        context: &ExecutionContext,
    ) -> PluginResult<ToolResult> {
        let plugin = self.load(name).await?;
        self.engine.execute_tool(&plugin, tool, args, context).await
    }

    /// Call a skill of an installed plugin by name.
    ///
    /// # Errors
    ///
    /// See [`SandboxEngine::execute_skill`].
    pub async fn invoke_skill(
        &self,
        name: &str,
        skill: &str,
        query: &str,
        context: &ExecutionContext,
    ) -> PluginResult<SkillResult> {
        let plugin = self.load(name).await?;
        self.engine.execute_skill(&plugin, skill, query, context).await
    }

    /// Route a free-text query to the first matching skill.
    ///
    /// # Errors
    ///
    /// See [`SandboxEngine::execute_skill_query`].
    pub async fn invoke_skill_query(
        &self,
        name: &str,
        query: &str,
        context: &ExecutionContext,
    ) -> PluginResult<(String, SkillResult)> {
        let plugin = self.load(name).await?;
        self.engine.execute_skill_query(&plugin, query, context).await
    }

    /// Deliver an event to an installed plugin's `kiln.on` handlers.
    ///
    /// # Errors
    ///
    /// See [`SandboxEngine::emit_event`].
    pub async fn emit_event(
        &self,
        name: &str,
        event: &str,
        payload: Value,
        context: &ExecutionContext,
    ) -> PluginResult<u64> {
        let plugin = self.load(name).await?;
        self.engine.emit_event(&plugin, event, payload, context).await
    }

    /// Search the registry.
    ///
    /// # Errors
    ///
    /// [`PluginError::Registry`] on an HTTP or decode failure.
    pub async fn search(&self, query: &str, limit: usize) -> PluginResult<Vec<SearchResult>> {
        self.fetcher.registry().search(query, limit).await
    }
}

async fn validate_and_build(
    staged: &StagedSource,
    options: BuildOptions,
) -> PluginResult<(PluginManifest, BuildOutput)> {
    let root = staged.root().to_path_buf();
    let node_modules = staged.node_modules().map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || {
        let manifest = validate::load_and_validate(&root)?;
        let output = build::build(&root, &manifest, &options, node_modules.as_deref())?;
        Ok((manifest, output))
    })
    .await
    .map_err(join_error)?
}

fn join_error(e: tokio::task::JoinError) -> PluginError {
    PluginError::io("blocking task failed", std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_storage::MemoryKvStore;

    use crate::registry::RegistryClient;
    use crate::sandbox::SandboxLimits;

    fn host(root: &Path) -> PluginHost {
        let memory: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let engine = SandboxEngine::new(SandboxLimits::default(), Arc::clone(&memory)).unwrap();
        PluginHost::new(
            PluginStore::new(root),
            Fetcher::new(RegistryClient::with_defaults().unwrap()),
            BuildOptions::default(),
            engine,
            memory,
        )
    }

    fn write_source(dir: &Path, manifest_extra: &str, code: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE_NAME),
            format!(
                "[plugin]\nname = \"echo\"\nversion = \"1.0.0\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"index.js\"\n{manifest_extra}"
            ),
        )
        .unwrap();
        std::fs::write(dir.join("index.js"), code).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_manifest_leaves_previous_install() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        write_source(
            &src,
            "[[tools.definitions]]\nname = \"echo\"\ndescription = \"echo\"\nparameters = { type = \"object\" }\n",
            "globalThis.__tool_echo = (a) => JSON.stringify(a);",
        );
        let host = host(&tmp.path().join("plugins"));
        let report = host
            .install(src.to_str().unwrap(), &InstallOptions::default())
            .await
            .unwrap();
        assert!(!report.replaced);
        assert!(!report.checksum_verified);

        std::fs::write(
            src.join(MANIFEST_FILE_NAME),
            "[plugin]\nname = \"echo\"\nversion = \"not-semver\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"index.js\"\n",
        )
        .unwrap();
        let err = host
            .install(src.to_str().unwrap(), &InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));

        let still = host.get("echo").await.unwrap();
        assert_eq!(still.manifest.plugin.version, "1.0.0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reinstall_reports_replacement_and_refreshes_code() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let tools = "[[tools.definitions]]\nname = \"which\"\ndescription = \"which\"\nparameters = { type = \"object\" }\n";
        write_source(&src, tools, "globalThis.__tool_which = () => 'one';");
        let host = host(&tmp.path().join("plugins"));
        let ctx = ExecutionContext::cli();

        host.install(src.to_str().unwrap(), &InstallOptions::default())
            .await
            .unwrap();
        let first = host
            .invoke_tool("echo", "which", Value::Null, &ctx)
            .await
            .unwrap();
        assert_eq!(first.output.as_deref(), Some("one"));

        write_source(&src, tools, "globalThis.__tool_which = () => 'two';");
        let report = host
            .install(src.to_str().unwrap(), &InstallOptions::default())
            .await
            .unwrap();
        assert!(report.replaced);

        let second = host
            .invoke_tool("echo", "which", Value::Null, &ctx)
            .await
            .unwrap();
        assert_eq!(second.output.as_deref(), Some("two"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typescript_entry_with_transpile_disabled_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(
            src.join(MANIFEST_FILE_NAME),
            "[plugin]\nname = \"typed\"\nversion = \"1.0.0\"\ndescription = \"d\"\nauthor = \"a\"\n[runtime]\nentry = \"index.ts\"\n",
        )
        .unwrap();
        std::fs::write(src.join("index.ts"), "const x: number = 1;").unwrap();

        let host = host(&tmp.path().join("plugins"));
        let options = InstallOptions {
            transpile: false,
            ..InstallOptions::default()
        };
        let err = host.install(src.to_str().unwrap(), &options).await.unwrap_err();
        assert!(matches!(err, PluginError::TransformFailed { .. }));
        assert!(host.list().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_plugin_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path());
        assert!(matches!(
            host.remove("ghost").await.unwrap_err(),
            PluginError::PluginNotFound(_)
        ));
        assert!(matches!(
            host.invoke_tool("ghost", "x", Value::Null, &ExecutionContext::cli())
                .await
                .unwrap_err(),
            PluginError::PluginNotFound(_)
        ));
    }
}
