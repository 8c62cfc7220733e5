//! Manifest validation.
//!
//! Every rule is a hard stop: the first violation aborts the install with
//! [`PluginError::ManifestInvalid`] before any build step runs.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use semver::{Version, VersionReq};

use crate::error::{PluginError, PluginResult};
use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest, SkillDefinition, ToolDefinition};
use crate::plugin::PluginId;

/// Version of the plugin-facing API this host implements.
pub const SDK_VERSION: &str = "1.0.0";

/// Load and validate the manifest in `dir`.
///
/// # Errors
///
/// Returns [`PluginError::ManifestInvalid`] on any violation.
pub fn load_and_validate(dir: &Path) -> PluginResult<PluginManifest> {
    let manifest = PluginManifest::load_from_dir(dir)?;
    validate_manifest(&manifest, dir)?;
    Ok(manifest)
}

/// Validate `manifest` against the files in `dir`.
///
/// # Errors
///
/// Returns [`PluginError::ManifestInvalid`] naming the violated rule.
pub fn validate_manifest(manifest: &PluginManifest, dir: &Path) -> PluginResult<()> {
    let path = dir.join(MANIFEST_FILE_NAME);
    let invalid = |reason: String| PluginError::ManifestInvalid {
        path: path.clone(),
        reason,
    };

    if !PluginId::is_valid_id(&manifest.plugin.name) {
        return Err(invalid(format!(
            "name '{}' must match ^[a-z0-9-]+$, optionally prefixed by @scope/",
            manifest.plugin.name
        )));
    }

    Version::parse(&manifest.plugin.version).map_err(|e| {
        invalid(format!(
            "version '{}' is not a semantic version: {e}",
            manifest.plugin.version
        ))
    })?;

    for (field, value) in [
        ("description", &manifest.plugin.description),
        ("author", &manifest.plugin.author),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!("plugin.{field} must not be empty")));
        }
    }

    if let Some(req) = &manifest.runtime.sdk_version {
        check_sdk_requirement(req).map_err(&invalid)?;
    }

    let entry = entry_path(dir, &manifest.runtime.entry).map_err(&invalid)?;
    if !entry.is_file() {
        return Err(invalid(format!(
            "entry '{}' does not exist",
            manifest.runtime.entry
        )));
    }

    let mut seen = HashSet::new();
    for tool in &manifest.tools.definitions {
        validate_handler_name("tool", &tool.name).map_err(&invalid)?;
        if !seen.insert(tool.name.as_str()) {
            return Err(invalid(format!("duplicate tool '{}'", tool.name)));
        }
        validate_tool_schema(tool).map_err(&invalid)?;
    }

    let mut seen = HashSet::new();
    for skill in &manifest.skills.definitions {
        validate_handler_name("skill", &skill.name).map_err(&invalid)?;
        if !seen.insert(skill.name.as_str()) {
            return Err(invalid(format!("duplicate skill '{}'", skill.name)));
        }
        validate_skill(skill).map_err(&invalid)?;
    }

    Ok(())
}

/// Resolve the entry path, refusing absolute paths and `..` components.
///
/// # Errors
///
/// Returns a description of the problem.
pub fn entry_path(dir: &Path, entry: &str) -> Result<PathBuf, String> {
    if entry.trim().is_empty() {
        return Err("runtime.entry must not be empty".to_string());
    }
    let rel = Path::new(entry);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {},
            _ => {
                return Err(format!(
                    "entry '{entry}' must be a relative path inside the plugin"
                ));
            },
        }
    }
    Ok(dir.join(rel))
}

fn check_sdk_requirement(req: &str) -> Result<(), String> {
    let parsed = VersionReq::parse(req)
        .map_err(|e| format!("sdk_version '{req}' is not a version requirement: {e}"))?;
    let host = Version::parse(SDK_VERSION).map_err(|e| e.to_string())?;
    if !parsed.matches(&host) {
        return Err(format!(
            "sdk_version '{req}' is not satisfied by host SDK {SDK_VERSION}"
        ));
    }
    Ok(())
}

/// Handler names become part of a JavaScript identifier.
fn validate_handler_name(kind: &str, name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(format!(
            "{kind} name '{name}' must be an identifier ([A-Za-z_][A-Za-z0-9_]*)"
        ))
    }
}

fn validate_tool_schema(tool: &ToolDefinition) -> Result<(), String> {
    let name = &tool.name;
    if tool.description.trim().is_empty() {
        return Err(format!("tool '{name}': description must not be empty"));
    }
    let schema = tool
        .parameters
        .as_object()
        .ok_or_else(|| format!("tool '{name}': parameters must be a table"))?;

    if schema.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Err(format!("tool '{name}': parameters.type must be \"object\""));
    }

    let properties = match schema.get("properties") {
        None => None,
        Some(p) => Some(
            p.as_object()
                .ok_or_else(|| format!("tool '{name}': parameters.properties must be a table"))?,
        ),
    };
    if let Some(props) = properties {
        for (prop, spec) in props {
            if !spec.is_object() {
                return Err(format!(
                    "tool '{name}': property '{prop}' must be a schema table"
                ));
            }
        }
    }

    if let Some(required) = schema.get("required") {
        let required = required
            .as_array()
            .ok_or_else(|| format!("tool '{name}': parameters.required must be an array"))?;
        for field in required {
            let field = field.as_str().ok_or_else(|| {
                format!("tool '{name}': parameters.required entries must be strings")
            })?;
            if !properties.is_some_and(|p| p.contains_key(field)) {
                return Err(format!(
                    "tool '{name}': required field '{field}' is not a declared property"
                ));
            }
        }
    }

    Ok(())
}

fn validate_skill(skill: &SkillDefinition) -> Result<(), String> {
    let name = &skill.name;
    if skill.description.trim().is_empty() {
        return Err(format!("skill '{name}': description must not be empty"));
    }
    if skill.patterns.is_empty() || skill.patterns.iter().any(|p| p.trim().is_empty()) {
        return Err(format!(
            "skill '{name}': patterns must be a non-empty list of non-empty strings"
        ));
    }
    if skill.examples.is_empty() || skill.examples.iter().any(|e| e.trim().is_empty()) {
        return Err(format!(
            "skill '{name}': examples must be a non-empty list of non-empty strings"
        ));
    }
    Ok(())
}
