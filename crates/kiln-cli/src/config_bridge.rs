//! Map `kiln_config` types onto telemetry and plugin-host types.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kiln_config::{Config, ResolvedConfig};
use kiln_plugins::{
    BuildOptions, Fetcher, PluginHost, PluginStore, RegistryClient, SandboxEngine, SandboxLimits,
};
use kiln_storage::{FileKvStore, KvStore};
use kiln_telemetry::{LogConfig, LogFormat, LogTarget};

/// Convert config to [`LogConfig`].
pub(crate) fn to_log_config(cfg: &Config) -> LogConfig {
    let format = match cfg.logging.format.as_str() {
        "pretty" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        "full" => LogFormat::Full,
        _ => LogFormat::Compact,
    };

    let mut log_config = LogConfig::new(&cfg.logging.level).with_format(format);
    if let Some(dir) = &cfg.logging.directory {
        log_config = log_config.with_target(LogTarget::File(dir.clone()));
    }
    for directive in &cfg.logging.directives {
        log_config = log_config.with_directive(directive);
    }

    log_config
}

/// Convert config to [`SandboxLimits`].
pub(crate) fn to_sandbox_limits(cfg: &Config) -> SandboxLimits {
    SandboxLimits {
        memory_limit: cfg.sandbox.memory_limit_bytes(),
        timeout: cfg.sandbox.timeout(),
        max_instances_per_plugin: cfg.sandbox.max_instances_per_plugin,
        max_idle_per_plugin: cfg.sandbox.max_idle_per_plugin,
        idle_ttl: cfg.sandbox.idle_ttl(),
    }
}

/// Convert config to [`BuildOptions`]. Kill-switches have already been
/// folded into `transpile` and `bundle` by the env layer.
pub(crate) fn to_build_options(cfg: &Config) -> BuildOptions {
    BuildOptions {
        transpile: cfg.build.transpile,
        bundle: cfg.build.bundle,
        esbuild: cfg.build.esbuild.clone(),
        target: cfg.build.target.clone(),
        minify: cfg.build.minify,
    }
}

/// Convert config to a [`RegistryClient`].
pub(crate) fn to_registry_client(cfg: &Config) -> anyhow::Result<RegistryClient> {
    RegistryClient::new(
        &cfg.registry.url,
        Duration::from_secs(cfg.registry.timeout_secs),
        cfg.registry.max_download_mb.saturating_mul(1024 * 1024),
    )
    .with_context(|| format!("invalid registry URL '{}'", cfg.registry.url))
}

/// Everything a command needs.
pub(crate) struct HostContext {
    /// The assembled host.
    pub(crate) host: PluginHost,
    /// The writable plugin root.
    pub(crate) plugin_dir: PathBuf,
}

/// Build a [`PluginHost`] from the resolved config and an optional
/// `--dir` override.
pub(crate) fn build_host(resolved: &ResolvedConfig, dir: Option<&Path>) -> anyhow::Result<HostContext> {
    let cfg = &resolved.config;
    let plugin_dir = resolved.plugin_dir(dir);

    let memory_dir = resolved.memory_dir();
    let memory: Arc<dyn KvStore> = Arc::new(
        FileKvStore::open(&memory_dir)
            .with_context(|| format!("failed to open memory store at {}", memory_dir.display()))?,
    );
    let engine = SandboxEngine::new(to_sandbox_limits(cfg), Arc::clone(&memory))
        .context("failed to start sandbox engine")?;

    let store = PluginStore::new(&plugin_dir).with_search_path(cfg.plugins.search_path.clone());
    let host = PluginHost::new(
        store,
        Fetcher::new(to_registry_client(cfg)?).with_npm(cfg.build.npm.clone()),
        to_build_options(cfg),
        engine,
        memory,
    );

    Ok(HostContext { host, plugin_dir })
}
