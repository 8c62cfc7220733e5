//! Layered configuration for the Kiln plugin host.
//!
//! Precedence, highest first:
//!
//! 1. Command-line flags (applied by callers, e.g. [`ResolvedConfig::plugin_dir`])
//! 2. `KILN_*` environment variables
//! 3. User config (`--config`, else `{kiln_home}/config.toml`)
//! 4. Embedded `defaults.toml`
//!
//! `kiln_home` is `KILN_HOME` when set, otherwise `~/.kiln`.
//!
//! ```rust,no_run
//! let resolved = kiln_config::load(&kiln_config::LoadOptions::default()).unwrap();
//! println!("plugins live in {}", resolved.plugin_dir(None).display());
//! ```
//!
//! This crate depends on no other Kiln crate; the binary maps these types
//! onto telemetry and plugin-host types at startup.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod env;
pub mod error;
pub mod loader;
pub mod types;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{LoadOptions, ResolvedConfig, load, load_with_env};
pub use types::{BuildConfig, Config, LoggingConfig, PluginsConfig, RegistryConfig, SandboxConfig};
