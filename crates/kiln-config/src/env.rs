//! `KILN_*` environment variable overrides.
//!
//! Env vars override every file layer. They are applied to the merged TOML
//! tree before deserialization so the same schema validation covers them.

use std::collections::HashMap;
use std::hash::BuildHasher;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Home directory override (default `~/.kiln`).
pub const KILN_HOME: &str = "KILN_HOME";
/// Install root override.
pub const KILN_PLUGIN_DIR: &str = "KILN_PLUGIN_DIR";
/// Extra colon-separated plugin roots.
pub const KILN_PLUGIN_PATH: &str = "KILN_PLUGIN_PATH";
/// Kill-switch disabling the bundle stage for every install.
pub const KILN_NO_BUNDLE: &str = "KILN_NO_BUNDLE";
/// Kill-switch disabling the transform stage for every install.
pub const KILN_NO_TRANSPILE: &str = "KILN_NO_TRANSPILE";

#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    PathList,
    UInt,
    /// A truthy value writes `false` to the field.
    KillSwitch,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: Kind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: KILN_PLUGIN_DIR,
        field_path: "plugins.dir",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: KILN_PLUGIN_PATH,
        field_path: "plugins.search_path",
        kind: Kind::PathList,
    },
    EnvMapping {
        var_name: "KILN_MEMORY_DIR",
        field_path: "plugins.memory_dir",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: KILN_NO_BUNDLE,
        field_path: "build.bundle",
        kind: Kind::KillSwitch,
    },
    EnvMapping {
        var_name: KILN_NO_TRANSPILE,
        field_path: "build.transpile",
        kind: Kind::KillSwitch,
    },
    EnvMapping {
        var_name: "KILN_ESBUILD",
        field_path: "build.esbuild",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: "KILN_NPM",
        field_path: "build.npm",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: "KILN_REGISTRY_URL",
        field_path: "registry.url",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: "KILN_SANDBOX_TIMEOUT_SECS",
        field_path: "sandbox.timeout_secs",
        kind: Kind::UInt,
    },
    EnvMapping {
        var_name: "KILN_SANDBOX_MEMORY_MB",
        field_path: "sandbox.memory_limit_mb",
        kind: Kind::UInt,
    },
    EnvMapping {
        var_name: "KILN_LOG_LEVEL",
        field_path: "logging.level",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: "KILN_LOG_FORMAT",
        field_path: "logging.format",
        kind: Kind::Str,
    },
];

/// Snapshot the process environment, keeping only `KILN_*` variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("KILN_"))
        .collect()
}

/// Whether an env var value means "on".
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Apply env overrides onto the merged tree. Returns how many applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a numeric variable does not parse.
pub fn apply_env_overrides<S: BuildHasher>(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        let value = match mapping.kind {
            Kind::Str => {
                if raw.is_empty() {
                    continue;
                }
                toml::Value::String(raw.clone())
            },
            Kind::PathList => toml::Value::Array(
                std::env::split_paths(raw)
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| toml::Value::String(p.display().to_string()))
                    .collect(),
            ),
            Kind::UInt => {
                let n: i64 = raw.trim().parse().map_err(|e| ConfigError::EnvError {
                    var: mapping.var_name.to_string(),
                    message: format!("expected a non-negative integer: {e}"),
                })?;
                if n < 0 {
                    return Err(ConfigError::EnvError {
                        var: mapping.var_name.to_string(),
                        message: "expected a non-negative integer".to_string(),
                    });
                }
                toml::Value::Integer(n)
            },
            Kind::KillSwitch => {
                if !is_truthy(raw) {
                    continue;
                }
                toml::Value::Boolean(false)
            },
        };

        debug!(var = mapping.var_name, field = mapping.field_path, "applying env override");
        set_field(merged, mapping.field_path, value);
        count = count.saturating_add(1);
    }

    Ok(count)
}

/// Set a dotted field path, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(leaf) = parts.pop() else {
        return;
    };

    let mut current = root;
    for part in parts {
        let toml::Value::Table(table) = current else {
            return;
        };
        current = table
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    if let toml::Value::Table(table) = current {
        table.insert(leaf.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn kill_switch_only_fires_when_truthy() {
        let mut tree: toml::Value = toml::from_str("[build]\nbundle = true\n").unwrap();
        apply_env_overrides(&mut tree, &env(&[(KILN_NO_BUNDLE, "0")])).unwrap();
        assert_eq!(tree["build"]["bundle"].as_bool(), Some(true));

        apply_env_overrides(&mut tree, &env(&[(KILN_NO_BUNDLE, "yes")])).unwrap();
        assert_eq!(tree["build"]["bundle"].as_bool(), Some(false));
    }

    #[test]
    fn path_list_splits_on_colon() {
        let mut tree = toml::Value::Table(toml::map::Map::new());
        apply_env_overrides(&mut tree, &env(&[(KILN_PLUGIN_PATH, "/a:/b::/c")])).unwrap();
        let list = tree["plugins"]["search_path"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[1].as_str(), Some("/b"));
    }

    #[test]
    fn bad_integer_is_an_error() {
        let mut tree = toml::Value::Table(toml::map::Map::new());
        let err =
            apply_env_overrides(&mut tree, &env(&[("KILN_SANDBOX_TIMEOUT_SECS", "soon")]))
                .unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { .. }));
    }

    #[test]
    fn creates_missing_tables() {
        let mut tree = toml::Value::Table(toml::map::Map::new());
        let n = apply_env_overrides(&mut tree, &env(&[("KILN_REGISTRY_URL", "http://x")])).unwrap();
        assert_eq!(n, 1);
        assert_eq!(tree["registry"]["url"].as_str(), Some("http://x"));
    }

    #[test]
    fn npm_path_override() {
        let mut tree: toml::Value = toml::from_str("[build]
bundle = true
").unwrap();
        apply_env_overrides(&mut tree, &env(&[("KILN_NPM", "/opt/node/bin/npm")])).unwrap();
        assert_eq!(tree["build"]["npm"].as_str(), Some("/opt/node/bin/npm"));
        assert_eq!(tree["build"]["bundle"].as_bool(), Some(true));
    }
}
