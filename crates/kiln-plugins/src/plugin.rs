//! Plugin identity.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Unique, stable plugin identifier: `name` or `@scope/name`.
///
/// Both segments must be non-empty, contain only lowercase ASCII
/// alphanumerics and hyphens, and not start or end with a hyphen. That
/// keeps every identity safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct PluginId(String);

/// Deserialize with validation so crafted lockfiles and install records
/// cannot smuggle path components.
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl From<PluginId> for String {
    fn from(id: PluginId) -> Self {
        id.0
    }
}

impl PluginId {
    /// Create a validated `PluginId`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the string is malformed.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `PluginId` from a known-good literal.
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// The full identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The scope without the `@`, if scoped.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.0
            .strip_prefix('@')
            .and_then(|rest| rest.split_once('/'))
            .map(|(scope, _)| scope)
    }

    /// The unscoped name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, n)| n)
    }

    /// Install directory relative to the plugin root (`@scope/name` nests).
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        match self.scope() {
            Some(scope) => PathBuf::from(format!("@{scope}")).join(self.name()),
            None => PathBuf::from(self.name()),
        }
    }

    /// Flat form usable as a single file name (`@scope/name` → `scope__name`).
    #[must_use]
    pub fn file_stem(&self) -> String {
        match self.scope() {
            Some(scope) => format!("{scope}__{}", self.name()),
            None => self.name().to_string(),
        }
    }

    /// Memory namespace owned by this plugin.
    #[must_use]
    pub fn memory_namespace(&self) -> String {
        kiln_storage::plugin_namespace(&self.0)
    }

    /// Whether `s` is a valid identity.
    #[must_use]
    pub fn is_valid_id(s: &str) -> bool {
        Self::validate(s).is_ok()
    }

    /// Whether `s` is a valid single segment (scope or name).
    #[must_use]
    pub fn is_valid_segment(s: &str) -> bool {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !s.starts_with('-')
            && !s.ends_with('-')
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidId("plugin id must not be empty".into()));
        }
        let (scope, name) = match id.strip_prefix('@') {
            Some(rest) => match rest.split_once('/') {
                Some((scope, name)) => (Some(scope), name),
                None => {
                    return Err(PluginError::InvalidId(format!(
                        "scoped plugin id must look like @scope/name, got: {id}"
                    )));
                },
            },
            None => (None, id),
        };
        if let Some(scope) = scope
            && !Self::is_valid_segment(scope)
        {
            return Err(PluginError::InvalidId(format!(
                "scope must contain only lowercase alphanumeric characters and hyphens, got: {id}"
            )));
        }
        if !Self::is_valid_segment(name) {
            return Err(PluginError::InvalidId(format!(
                "plugin name must contain only lowercase alphanumeric characters and hyphens \
                 and must not start or end with a hyphen, got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for PluginId {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
