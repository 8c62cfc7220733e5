//! Configuration struct definitions.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin directory settings.
    pub plugins: PluginsConfig,
    /// Build pipeline defaults.
    pub build: BuildConfig,
    /// Sandbox quotas and instance pool sizing.
    pub sandbox: SandboxConfig,
    /// Remote registry client.
    pub registry: RegistryConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Where plugins are installed and looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Install root. `None` means `{kiln_home}/plugins`.
    pub dir: Option<PathBuf>,
    /// Extra read-only roots consulted by `list` and lookups.
    pub search_path: Vec<PathBuf>,
    /// Memory store directory. `None` means `{kiln_home}/memory`.
    pub memory_dir: Option<PathBuf>,
}

/// Build pipeline defaults; per-install flags can only turn stages off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Run the TypeScript transform stage.
    pub transpile: bool,
    /// Run the dependency bundling stage.
    pub bundle: bool,
    /// Explicit bundler binary; looked up on `PATH` when unset.
    pub esbuild: Option<PathBuf>,
    /// Explicit `npm` binary for installing the dependencies of fetched
    /// plugins; looked up on `PATH` when unset.
    pub npm: Option<PathBuf>,
    /// Bundler language target.
    pub target: String,
    /// Minify bundled output.
    pub minify: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            transpile: true,
            bundle: true,
            esbuild: None,
            npm: None,
            target: "es2020".to_string(),
            minify: false,
        }
    }
}

/// Sandbox quotas and warm-instance policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter heap ceiling per instance, in MiB.
    pub memory_limit_mb: u64,
    /// Wall-clock quota per invocation, in seconds.
    pub timeout_secs: u64,
    /// Concurrent instances allowed per plugin.
    pub max_instances_per_plugin: usize,
    /// Idle instances retained per plugin for reuse.
    pub max_idle_per_plugin: usize,
    /// Idle instances older than this are discarded, in seconds.
    pub idle_ttl_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            timeout_secs: 30,
            max_instances_per_plugin: 4,
            max_idle_per_plugin: 2,
            idle_ttl_secs: 300,
        }
    }
}

impl SandboxConfig {
    /// Memory ceiling in bytes.
    #[must_use]
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    /// Invocation quota.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Idle retention.
    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Registry client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the registry API.
    pub url: String,
    /// Request timeout, in seconds.
    pub timeout_secs: u64,
    /// Download size cap, in MiB.
    pub max_download_mb: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "https://registry.kiln.dev".to_string(),
            timeout_secs: 30,
            max_download_mb: 50,
        }
    }
}

/// Logging settings (mapped onto the telemetry crate by the binary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level filter.
    pub level: String,
    /// Output format name.
    pub format: String,
    /// Optional directory for file logging.
    pub directory: Option<PathBuf>,
    /// Extra filter directives.
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            directory: None,
            directives: Vec::new(),
        }
    }
}
