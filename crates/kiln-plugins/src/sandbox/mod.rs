//! Sandbox execution engine.
//!
//! Plugins run inside isolated `QuickJS` instances, one OS thread each,
//! with a heap ceiling, a wall-clock quota and a capability surface built
//! from the plugin's declared permissions:
//!
//! - `fetch(url, init)`, gated by `permissions.network`
//! - `fs.readFile` / `fs.writeFile`, gated by `file_read` and `file_write`
//! - `env.get`, gated by `env_vars`
//! - `memory.*`, bound to the plugin's own namespace
//! - `console.*`, routed to `tracing` under the `kiln::plugin` target
//! - `kiln.pluginId`, `kiln.context` and `kiln.on(event, handler)`
//!
//! Transformed plugins carry a source map. Stack traces of thrown errors
//! are rewritten through it so they point into the plugin's own source.
//!
//! A denied capability throws `PermissionDenied` inside the handler and
//! leaves the instance usable. A quota violation surfaces as
//! [`PluginError::ResourceExceeded`] and the instance is discarded.

mod capabilities;
mod context;
mod fence;
mod instance;
mod pool;
mod result;
mod skill_match;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kiln_storage::{KvStore, ScopedKvStore};
use serde_json::Value;

pub use context::ExecutionContext;
pub use result::{
    SkillAction, SkillResult, ToolResult, skill_result_from_value, tool_result_from_value,
};
pub use skill_match::{SkillMatcher, compile_pattern};

use self::fence::{MemoryFence, Retirement};
use self::instance::{Call, HandlerKind, Instance, InstanceSpec, Outcome};
use self::pool::{InstancePool, PoolLimits};
use crate::build::{ARTIFACT_FILE_NAME, SOURCE_MAP_FILE_NAME};
use crate::error::{PluginError, PluginResult};
use crate::integrity::artifact_digest;
use crate::manifest::PluginManifest;
use crate::plugin::PluginId;
use crate::security::{LayeredGate, ManifestGate, PluginSecurityGate};
use crate::sourcemap::SourceMapRegistry;

/// Quotas and pool sizing for sandbox instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Interpreter heap ceiling in bytes.
    pub memory_limit: u64,
    /// Wall-clock quota per invocation.
    pub timeout: Duration,
    /// Concurrent instances per plugin.
    pub max_instances_per_plugin: usize,
    /// Idle instances kept per plugin.
    pub max_idle_per_plugin: usize,
    /// Idle instances older than this are dropped.
    pub idle_ttl: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            timeout: Duration::from_secs(30),
            max_instances_per_plugin: 4,
            max_idle_per_plugin: 2,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

/// An installed plugin's manifest and built artifact, ready to execute.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// Plugin identity.
    pub id: PluginId,
    /// Validated manifest.
    pub manifest: PluginManifest,
    /// Artifact source.
    pub artifact: Arc<str>,
    /// `blake3:` digest of the artifact; instances are keyed by it.
    pub digest: String,
    /// Install directory.
    pub root: PathBuf,
    /// Source map of the artifact, when the build produced one.
    pub source_map: Option<Arc<str>>,
    matcher: SkillMatcher,
}

impl LoadedPlugin {
    /// Load `plugin.toml`, `index.js` and, if present, `index.js.map`
    /// from an install directory.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestInvalid`] or [`PluginError::Io`] if
    /// the manifest or artifact is missing, or any file is unreadable.
    pub fn load(dir: &Path) -> PluginResult<Self> {
        let manifest = PluginManifest::load_from_dir(dir)?;
        let artifact_path = dir.join(ARTIFACT_FILE_NAME);
        let artifact = std::fs::read_to_string(&artifact_path).map_err(|e| {
            PluginError::io(format!("failed to read {}", artifact_path.display()), e)
        })?;
        let map_path = dir.join(SOURCE_MAP_FILE_NAME);
        let source_map = match std::fs::read_to_string(&map_path) {
            Ok(map) => Some(map),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(PluginError::io(
                    format!("failed to read {}", map_path.display()),
                    e,
                ));
            },
        };
        let plugin = Self::from_parts(manifest, artifact, dir.to_path_buf())?;
        Ok(match source_map {
            Some(map) => plugin.with_source_map(map),
            None => plugin,
        })
    }

    /// Build from an in-memory manifest and artifact.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the manifest name is malformed.
    pub fn from_parts(
        manifest: PluginManifest,
        artifact: impl Into<Arc<str>>,
        root: PathBuf,
    ) -> PluginResult<Self> {
        let artifact: Arc<str> = artifact.into();
        Ok(Self {
            id: manifest.id()?,
            digest: artifact_digest(artifact.as_bytes()),
            matcher: SkillMatcher::new(&manifest.skills.definitions),
            manifest,
            artifact,
            root,
            source_map: None,
        })
    }

    /// Attach the artifact's source map.
    #[must_use]
    pub fn with_source_map(mut self, map: impl Into<Arc<str>>) -> Self {
        self.source_map = Some(map.into());
        self
    }

    /// First declared skill whose patterns match `query`.
    #[must_use]
    pub fn match_skill(&self, query: &str) -> Option<&str> {
        self.matcher.find(query)
    }
}

/// Runs plugin handlers inside pooled sandbox instances.
pub struct SandboxEngine {
    limits: SandboxLimits,
    memory: Arc<dyn KvStore>,
    http: reqwest::Client,
    extra_gate: Option<Arc<dyn PluginSecurityGate>>,
    pool: InstancePool,
    fences: DashMap<PluginId, MemoryFence>,
    source_maps: SourceMapRegistry,
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("limits", &self.limits)
            .field("extra_gate", &self.extra_gate.is_some())
            .finish_non_exhaustive()
    }
}

impl SandboxEngine {
    /// Create an engine backed by `memory`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Sandbox`] if the HTTP client cannot be built.
    pub fn new(limits: SandboxLimits, memory: Arc<dyn KvStore>) -> PluginResult<Self> {
        // Redirects are not followed: a 3xx could point outside the allowlist.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(limits.timeout)
            .user_agent(concat!("kiln-plugin/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginError::Sandbox {
                plugin: "*".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            pool: InstancePool::new(PoolLimits {
                max_instances: limits.max_instances_per_plugin,
                max_idle: limits.max_idle_per_plugin,
                idle_ttl: limits.idle_ttl,
            }),
            limits,
            memory,
            http,
            extra_gate: None,
            fences: DashMap::new(),
            source_maps: SourceMapRegistry::new(),
        })
    }

    /// Stack an embedder gate on top of every plugin's manifest gate.
    #[must_use]
    pub fn with_security_gate(mut self, gate: Arc<dyn PluginSecurityGate>) -> Self {
        self.extra_gate = Some(gate);
        self
    }

    /// Configured limits.
    #[must_use]
    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Source maps of plugins that have run.
    #[must_use]
    pub fn source_maps(&self) -> &SourceMapRegistry {
        &self.source_maps
    }

    /// Call a declared tool.
    ///
    /// A string return is wrapped as successful output and a thrown error
    /// becomes `success = false` with its message.
    ///
    /// # Errors
    ///
    /// [`PluginError::HandlerNotFound`] if the tool is undeclared or not
    /// exported, [`PluginError::InvalidResult`] for a malformed return,
    /// [`PluginError::ResourceExceeded`] on a quota violation.
    pub async fn execute_tool(
        &self,
        plugin: &LoadedPlugin,
        tool: &str,
        args: Value,
        context: &ExecutionContext,
    ) -> PluginResult<ToolResult> {
        if plugin.manifest.tool(tool).is_none() {
            return Err(not_found(plugin, tool));
        }
        let args = if args.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            args
        };
        tracing::debug!(plugin = %plugin.id, tool, "Executing tool");

        let call = Call::Handler {
            kind: HandlerKind::Tool,
            name: tool.to_string(),
            args,
        };
        match self.run(plugin, call, context).await? {
            Outcome::Returned(value) => tool_result_from_value(&format!("__tool_{tool}"), value),
            Outcome::Threw { message, stack, .. } => {
                log_stack(plugin, tool, stack.as_deref());
                Ok(ToolResult::failed(message))
            },
            Outcome::Missing => Err(not_found(plugin, tool)),
        }
    }

    /// Call a declared skill by name.
    ///
    /// # Errors
    ///
    /// As for [`execute_tool`](Self::execute_tool).
    pub async fn execute_skill(
        &self,
        plugin: &LoadedPlugin,
        skill: &str,
        query: &str,
        context: &ExecutionContext,
    ) -> PluginResult<SkillResult> {
        if plugin.manifest.skill(skill).is_none() {
            return Err(not_found(plugin, skill));
        }
        tracing::debug!(plugin = %plugin.id, skill, "Executing skill");

        let call = Call::Handler {
            kind: HandlerKind::Skill,
            name: skill.to_string(),
            args: serde_json::json!({ "query": query, "context": context }),
        };
        match self.run(plugin, call, context).await? {
            Outcome::Returned(value) => skill_result_from_value(&format!("__skill_{skill}"), value),
            Outcome::Threw { message, stack, .. } => {
                log_stack(plugin, skill, stack.as_deref());
                Ok(SkillResult::failed(message))
            },
            Outcome::Missing => Err(not_found(plugin, skill)),
        }
    }

    /// Route `query` to the first skill whose patterns match it.
    ///
    /// # Errors
    ///
    /// [`PluginError::HandlerNotFound`] if no pattern matches, otherwise as
    /// for [`execute_skill`](Self::execute_skill).
    pub async fn execute_skill_query(
        &self,
        plugin: &LoadedPlugin,
        query: &str,
        context: &ExecutionContext,
    ) -> PluginResult<(String, SkillResult)> {
        let Some(skill) = plugin.match_skill(query).map(str::to_string) else {
            return Err(not_found(plugin, query));
        };
        let result = self.execute_skill(plugin, &skill, query, context).await?;
        Ok((skill, result))
    }

    /// Run every handler registered with `kiln.on(event, ...)` and return
    /// how many ran.
    ///
    /// # Errors
    ///
    /// [`PluginError::InvalidResult`] if a handler throws, or a quota error.
    pub async fn emit_event(
        &self,
        plugin: &LoadedPlugin,
        event: &str,
        payload: Value,
        context: &ExecutionContext,
    ) -> PluginResult<u64> {
        let call = Call::Event {
            event: event.to_string(),
            payload,
        };
        match self.run(plugin, call, context).await? {
            Outcome::Returned(value) => Ok(value.as_u64().unwrap_or(0)),
            Outcome::Threw {
                name,
                message,
                stack,
            } => Err(PluginError::InvalidResult {
                handler: format!("on:{event}"),
                reason: match stack {
                    Some(stack) => format!("handler threw {name}: {message}\n{stack}"),
                    None => format!("handler threw {name}: {message}"),
                },
            }),
            Outcome::Missing => Ok(0),
        }
    }

    /// Drop warm instances of `id` after a reinstall. A plugin removed
    /// earlier gets its memory namespace back.
    pub async fn invalidate(&self, id: &PluginId) {
        self.fences.remove_if(id, |_, fence| fence.is_closed());
        self.pool.invalidate(id).await;
    }

    /// Cut `id` off from its memory namespace ahead of a purge. Waits for
    /// memory calls already running; later ones fail inside the handler
    /// until the plugin is installed again. Purge before dropping the
    /// returned value.
    pub(crate) async fn retire(&self, id: &PluginId) -> Retirement {
        self.pool.invalidate(id).await;
        self.source_maps.unregister(id);
        let fence = self.fence(id);
        fence.close().await
    }

    fn fence(&self, id: &PluginId) -> MemoryFence {
        self.fences.entry(id.clone()).or_default().clone()
    }

    /// Warm instances currently pooled for `id`.
    pub async fn idle_instances(&self, id: &PluginId) -> usize {
        self.pool.idle_count(id).await
    }

    async fn run(
        &self,
        plugin: &LoadedPlugin,
        call: Call,
        context: &ExecutionContext,
    ) -> PluginResult<Outcome> {
        self.track_source_map(plugin);
        let mut lease = self.pool.checkout(&plugin.id, &plugin.digest).await?;
        let instance = match lease.warm.take() {
            Some(instance) => instance,
            None => Instance::spawn(self.spec(plugin)?).await?,
        };

        let result = instance.run(call, context).await;
        match &result {
            Err(e) if e.is_fatal_to_instance() => {
                tracing::warn!(plugin = %plugin.id, error = %e, "Discarding sandbox instance");
            },
            _ => self.pool.checkin(lease, instance).await,
        }
        result.map(|outcome| match outcome {
            Outcome::Threw {
                name,
                message,
                stack: Some(stack),
            } => Outcome::Threw {
                name,
                message,
                stack: Some(self.source_maps.remap_stack(&plugin.id, &stack)),
            },
            other => other,
        })
    }

    fn track_source_map(&self, plugin: &LoadedPlugin) {
        match &plugin.source_map {
            Some(json) if !self.source_maps.is_current(&plugin.id, &plugin.digest) => {
                if let Err(e) = self.source_maps.register(&plugin.id, &plugin.digest, json) {
                    tracing::warn!(plugin = %plugin.id, error = %e, "Ignoring source map");
                    self.source_maps.unregister(&plugin.id);
                }
            },
            Some(_) => {},
            None => self.source_maps.unregister(&plugin.id),
        }
    }

    fn spec(&self, plugin: &LoadedPlugin) -> PluginResult<InstanceSpec> {
        let manifest_gate: Arc<dyn PluginSecurityGate> =
            Arc::new(ManifestGate::new(&plugin.manifest.permissions)?);
        let gate = match &self.extra_gate {
            Some(outer) => Arc::new(LayeredGate::new(manifest_gate, Arc::clone(outer))),
            None => manifest_gate,
        };
        Ok(InstanceSpec {
            plugin_id: plugin.id.clone(),
            artifact: Arc::clone(&plugin.artifact),
            generation: plugin.digest.clone(),
            gate,
            memory: ScopedKvStore::new(Arc::clone(&self.memory), plugin.id.memory_namespace())?,
            fence: self.fence(&plugin.id),
            http: self.http.clone(),
            memory_limit: self.limits.memory_limit,
            quota: self.limits.timeout,
        })
    }
}

fn log_stack(plugin: &LoadedPlugin, handler: &str, stack: Option<&str>) {
    if let Some(stack) = stack {
        tracing::debug!(plugin = %plugin.id, handler, stack, "Handler threw");
    }
}

fn not_found(plugin: &LoadedPlugin, handler: &str) -> PluginError {
    PluginError::HandlerNotFound {
        plugin: plugin.id.to_string(),
        handler: handler.to_string(),
    }
}
