//! Config file discovery and layered loading.
//!
//! 1. Parse embedded `defaults.toml`
//! 2. Deep-merge the user file (`--config`, else `{kiln_home}/config.toml`)
//! 3. Apply `KILN_*` env overrides
//! 4. Deserialize and validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{KILN_HOME, apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Config files larger than this are rejected.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Inputs that steer discovery.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file; must exist when set.
    pub config_file: Option<PathBuf>,
    /// Kiln home directory, bypassing `KILN_HOME` and `~/.kiln`.
    pub home_override: Option<PathBuf>,
}

/// A loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The effective configuration.
    pub config: Config,
    /// The Kiln home directory.
    pub kiln_home: PathBuf,
    /// Config files that contributed, in merge order.
    pub loaded_files: Vec<String>,
    /// Number of env overrides applied.
    pub env_overrides: usize,
}

impl ResolvedConfig {
    /// Resolve the install root: explicit flag, then config/env, then
    /// `{kiln_home}/plugins`.
    #[must_use]
    pub fn plugin_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.config.plugins.dir.clone())
            .unwrap_or_else(|| self.kiln_home.join("plugins"))
    }

    /// Directory of the persistent memory store.
    #[must_use]
    pub fn memory_dir(&self) -> PathBuf {
        self.config
            .plugins
            .memory_dir
            .clone()
            .unwrap_or_else(|| self.kiln_home.join("memory"))
    }
}

/// Load configuration from the process environment and disk.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a file is unreadable or malformed, an env
/// override is invalid, or the result fails validation.
pub fn load(options: &LoadOptions) -> ConfigResult<ResolvedConfig> {
    load_with_env(options, &collect_env_vars())
}

/// Like [`load`] but with an explicit environment snapshot.
///
/// # Errors
///
/// See [`load`].
pub fn load_with_env(
    options: &LoadOptions,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<ResolvedConfig> {
    let kiln_home = match &options.home_override {
        Some(h) => h.clone(),
        None => match env_vars.get(KILN_HOME).filter(|v| !v.is_empty()) {
            Some(h) => PathBuf::from(h),
            None => home_directory()?.join(".kiln"),
        },
    };

    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let mut loaded_files = Vec::new();

    let user_file = match &options.config_file {
        Some(path) => {
            let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
                path: path.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?;
            Some((overlay, path.clone()))
        },
        None => {
            let path = kiln_home.join("config.toml");
            try_load_file(&path)?.map(|v| (v, path))
        },
    };

    if let Some((overlay, path)) = user_file {
        deep_merge(&mut merged, &overlay);
        info!(path = %path.display(), "loaded user config");
        loaded_files.push(path.display().to_string());
    }

    let env_overrides = apply_env_overrides(&mut merged, env_vars)?;

    let config: Config = merged
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::SchemaError(e.to_string()))?;
    validate::validate(&config)?;

    debug!(
        home = %kiln_home.display(),
        files = loaded_files.len(),
        env_overrides,
        "configuration resolved"
    );

    Ok(ResolvedConfig {
        config,
        kiln_home,
        loaded_files,
        env_overrides,
    })
}

/// Recursively merge `overlay` into `base`; tables merge, everything else
/// replaces.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if u64::try_from(content.len()).unwrap_or(u64::MAX) > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!("config file exceeds the {MAX_CONFIG_FILE_SIZE} byte limit"),
        });
    }

    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(home: &Path) -> LoadOptions {
        LoadOptions {
            config_file: None,
            home_override: Some(home.to_path_buf()),
        }
    }

    #[test]
    fn defaults_only() {
        let home = tempfile::tempdir().unwrap();
        let resolved = load_with_env(&options(home.path()), &HashMap::new()).unwrap();
        assert_eq!(resolved.config, Config::default());
        assert!(resolved.loaded_files.is_empty());
        assert_eq!(resolved.plugin_dir(None), home.path().join("plugins"));
    }

    #[test]
    fn user_file_overrides_defaults() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[sandbox]\ntimeout_secs = 5\n[plugins]\ndir = \"/srv/plugins\"\n",
        )
        .unwrap();

        let resolved = load_with_env(&options(home.path()), &HashMap::new()).unwrap();
        assert_eq!(resolved.config.sandbox.timeout_secs, 5);
        assert_eq!(resolved.config.sandbox.memory_limit_mb, 64);
        assert_eq!(resolved.plugin_dir(None), PathBuf::from("/srv/plugins"));
        assert_eq!(resolved.loaded_files.len(), 1);
    }

    #[test]
    fn env_overrides_file_and_flag_overrides_env() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[plugins]\ndir = \"/from/file\"\n",
        )
        .unwrap();
        let env: HashMap<String, String> =
            [("KILN_PLUGIN_DIR".to_string(), "/from/env".to_string())].into();

        let resolved = load_with_env(&options(home.path()), &env).unwrap();
        assert_eq!(resolved.plugin_dir(None), PathBuf::from("/from/env"));
        assert_eq!(
            resolved.plugin_dir(Some(Path::new("/from/flag"))),
            PathBuf::from("/from/flag")
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        let opts = LoadOptions {
            config_file: Some(home.path().join("nope.toml")),
            home_override: Some(home.path().to_path_buf()),
        };
        assert!(load_with_env(&opts, &HashMap::new()).is_err());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join("config.toml"), "[sandbox\n").unwrap();
        let err = load_with_env(&options(home.path()), &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn kiln_home_env_is_honored() {
        let home = tempfile::tempdir().unwrap();
        let env: HashMap<String, String> =
            [("KILN_HOME".to_string(), home.path().display().to_string())].into();
        let resolved = load_with_env(&LoadOptions::default(), &env).unwrap();
        assert_eq!(resolved.kiln_home, home.path());
        assert_eq!(resolved.memory_dir(), home.path().join("memory"));
    }
}
