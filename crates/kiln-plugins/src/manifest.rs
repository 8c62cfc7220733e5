//! Plugin manifest (`plugin.toml`) types.
//!
//! ```toml
//! [plugin]
//! name = "weather"
//! version = "1.2.0"
//! description = "Forecasts"
//! author = "Jo"
//! license = "MIT"
//!
//! [runtime]
//! entry = "src/index.ts"
//! sdk_version = "^1.0"
//!
//! [permissions]
//! network = ["api.example.com"]
//!
//! [[tools.definitions]]
//! name = "forecast"
//! description = "Get a forecast"
//! parameters = { type = "object", properties = { city = { type = "string" } }, required = ["city"] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// Standard manifest file name.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";

/// A parsed plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Identity and descriptive metadata.
    pub plugin: PluginMetadata,
    /// Entry point and runtime requirements.
    pub runtime: RuntimeSection,
    /// Capabilities requested. Absent means deny everything.
    #[serde(default, skip_serializing_if = "PermissionSet::is_empty")]
    pub permissions: PermissionSet,
    /// Tool catalog.
    #[serde(default, skip_serializing_if = "ToolsSection::is_empty")]
    pub tools: ToolsSection,
    /// Skill catalog.
    #[serde(default, skip_serializing_if = "SkillsSection::is_empty")]
    pub skills: SkillsSection,
}

/// The `[plugin]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Identity, optionally `@scope/`-prefixed.
    pub name: String,
    /// Semantic version.
    pub version: String,
    /// One-line description.
    pub description: String,
    /// Author name or contact.
    pub author: String,
    /// SPDX license expression.
    #[serde(default)]
    pub license: String,
    /// Project homepage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// Source repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Search keywords.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

/// The `[runtime]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Entry source file, relative to the plugin directory.
    pub entry: String,
    /// Semver requirement on the host SDK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    /// Bare module specifiers that must be bundled in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Requested capabilities. The default grants nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    /// Hosts reachable through `fetch` (`api.example.com`, `*.example.com`).
    pub network: Vec<String>,
    /// Glob patterns readable through `fs.readFile`.
    pub file_read: Vec<String>,
    /// Whether `fs.writeFile` is allowed.
    pub file_write: bool,
    /// Environment variable names readable through `env.get`.
    pub env_vars: Vec<String>,
}

impl PermissionSet {
    /// Whether no capability is granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.network.is_empty()
            && self.file_read.is_empty()
            && !self.file_write
            && self.env_vars.is_empty()
    }
}

/// The `[tools]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsSection {
    /// Declared tools, in order.
    #[serde(default)]
    pub definitions: Vec<ToolDefinition>,
}

impl ToolsSection {
    fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// A declared tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name; the artifact must export `__tool_<name>`.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON-Schema-like object schema for the argument object.
    pub parameters: serde_json::Value,
}

/// The `[skills]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillsSection {
    /// Declared skills, in order.
    #[serde(default)]
    pub definitions: Vec<SkillDefinition>,
}

impl SkillsSection {
    fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// A declared skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillDefinition {
    /// Skill name; the artifact must export `__skill_<name>`.
    pub name: String,
    /// What the skill responds to.
    pub description: String,
    /// Match expressions (`*` and `?` wildcards, case-insensitive).
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Example queries.
    #[serde(default)]
    pub examples: Vec<String>,
}

impl PluginManifest {
    /// Parse a manifest from TOML text. Performs no semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestInvalid`] if the text does not parse.
    pub fn from_toml_str(content: &str, path: &Path) -> PluginResult<Self> {
        toml::from_str(content).map_err(|e| PluginError::ManifestInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Read and parse `plugin.toml` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestInvalid`] if the file is missing or
    /// does not parse.
    pub fn load_from_dir(dir: &Path) -> PluginResult<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let content =
            std::fs::read_to_string(&path).map_err(|e| PluginError::ManifestInvalid {
                path: path.clone(),
                reason: format!("cannot read manifest: {e}"),
            })?;
        Self::from_toml_str(&content, &path)
    }

    /// Serialize back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestInvalid`] if a value has no TOML form
    /// (for instance a JSON `null` inside a parameter schema).
    pub fn to_toml_string(&self) -> PluginResult<String> {
        toml::to_string_pretty(self).map_err(|e| PluginError::ManifestInvalid {
            path: MANIFEST_FILE_NAME.into(),
            reason: format!("cannot serialize manifest: {e}"),
        })
    }

    /// The plugin identity declared in `[plugin] name`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the name is malformed.
    pub fn id(&self) -> PluginResult<PluginId> {
        PluginId::new(self.plugin.name.clone())
    }

    /// Look up a declared tool.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.definitions.iter().find(|t| t.name == name)
    }

    /// Look up a declared skill.
    #[must_use]
    pub fn skill(&self, name: &str) -> Option<&SkillDefinition> {
        self.skills.definitions.iter().find(|s| s.name == name)
    }

    /// Whether the entry needs the TypeScript transform.
    #[must_use]
    pub fn entry_is_typescript(&self) -> bool {
        let entry = self.runtime.entry.to_ascii_lowercase();
        [".ts", ".mts", ".cts", ".tsx"]
            .iter()
            .any(|ext| entry.ends_with(ext))
            && !entry.ends_with(".d.ts")
    }
}
