//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Longest invocation quota accepted (one hour).
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Largest per-instance heap accepted (4 GiB).
const MAX_MEMORY_MB: u64 = 4096;

/// Validate a merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_sandbox(config)?;
    validate_registry(config)?;
    validate_build(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_sandbox(config: &Config) -> ConfigResult<()> {
    let s = &config.sandbox;
    if s.timeout_secs == 0 || s.timeout_secs > MAX_TIMEOUT_SECS {
        return Err(invalid(
            "sandbox.timeout_secs",
            format!("must be between 1 and {MAX_TIMEOUT_SECS}"),
        ));
    }
    if s.memory_limit_mb == 0 || s.memory_limit_mb > MAX_MEMORY_MB {
        return Err(invalid(
            "sandbox.memory_limit_mb",
            format!("must be between 1 and {MAX_MEMORY_MB}"),
        ));
    }
    if s.max_instances_per_plugin == 0 {
        return Err(invalid("sandbox.max_instances_per_plugin", "must be at least 1"));
    }
    if s.max_idle_per_plugin > s.max_instances_per_plugin {
        return Err(invalid(
            "sandbox.max_idle_per_plugin",
            "must not exceed sandbox.max_instances_per_plugin",
        ));
    }
    Ok(())
}

fn validate_registry(config: &Config) -> ConfigResult<()> {
    let r = &config.registry;
    if !(r.url.starts_with("https://") || r.url.starts_with("http://")) {
        return Err(invalid("registry.url", "must be an http(s) URL"));
    }
    if r.timeout_secs == 0 {
        return Err(invalid("registry.timeout_secs", "must be at least 1"));
    }
    if r.max_download_mb == 0 {
        return Err(invalid("registry.max_download_mb", "must be at least 1"));
    }
    Ok(())
}

fn validate_build(config: &Config) -> ConfigResult<()> {
    if config.build.target.trim().is_empty() {
        return Err(invalid("build.target", "must not be empty"));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let format = config.logging.format.to_ascii_lowercase();
    if !matches!(format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unknown format '{}'; expected pretty, compact, json or full",
                config.logging.format
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = Config::default();
        config.sandbox.timeout_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn idle_cannot_exceed_instances() {
        let mut config = Config::default();
        config.sandbox.max_idle_per_plugin = 10;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn registry_url_needs_scheme() {
        let mut config = Config::default();
        config.registry.url = "registry.kiln.dev".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(validate(&config).is_err());
    }
}
