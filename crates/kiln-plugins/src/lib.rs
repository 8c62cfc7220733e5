//! Install and run sandboxed JavaScript/TypeScript plugins.
//!
//! - [`source`]: classify an install source into a [`FetchPlan`]
//! - [`fetch`]: stage plugin files from the registry, a repository or a local path
//! - [`validate`]: enforce the [`PluginManifest`] rules
//! - [`build`]: TypeScript transform and dependency bundling into one artifact
//! - [`install`]: atomic placement in the plugin root, indexed by [`PluginId`]
//! - [`sandbox`]: `QuickJS` instances with quotas and capability gates
//! - [`sourcemap`]: stack traces mapped back to plugin sources
//! - [`PluginHost`]: the above wired together
//!
//! # Storage isolation
//!
//! Each plugin's `memory` API is bound to the namespace `plugin:{plugin_id}`
//! of the shared [`KvStore`](kiln_storage::KvStore). Removing a plugin purges
//! that namespace.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod build;
pub mod error;
pub mod fetch;
pub mod host;
pub mod install;
pub mod integrity;
pub mod lockfile;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod sandbox;
pub mod security;
pub mod source;
pub mod sourcemap;
pub mod validate;

pub use build::{BuildOptions, BuildOutput};
pub use error::{PluginError, PluginResult, ResourceKind};
pub use fetch::{Fetcher, Provenance, StagedSource};
pub use host::{InstallOptions, InstallReport, PluginHost};
pub use install::{InstallRecord, InstalledPlugin, PluginStore};
pub use lockfile::{IntegrityViolation, LockedPlugin, PluginLockfile};
pub use manifest::{PermissionSet, PluginManifest, SkillDefinition, ToolDefinition};
pub use plugin::PluginId;
pub use registry::{RegistryClient, RegistryPlugin, SearchResult};
pub use sandbox::{
    ExecutionContext, LoadedPlugin, SandboxEngine, SandboxLimits, SkillAction, SkillResult,
    ToolResult,
};
pub use security::{DenyAllGate, ManifestGate, PluginSecurityGate};
pub use source::FetchPlan;
pub use sourcemap::SourceMapRegistry;
