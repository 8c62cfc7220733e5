//! Registry wire types.

use serde::{Deserialize, Serialize};

/// Full metadata for one published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryPlugin {
    /// Identity (`name` or `@scope/name`).
    pub name: String,
    /// Published version.
    pub version: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Author name or contact.
    #[serde(default)]
    pub author: String,
    /// SPDX license expression.
    #[serde(default)]
    pub license: Option<String>,
    /// Where the bundle can be downloaded.
    pub download_url: String,
    /// Hex SHA-256 of the bundle. Installs are refused when absent.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Project homepage.
    #[serde(default)]
    pub homepage: Option<String>,
    /// Source repository.
    #[serde(default)]
    pub repository: Option<String>,
    /// Categories.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Total download count.
    #[serde(default)]
    pub downloads: u64,
    /// Last publish time, as reported by the registry.
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Identity.
    pub name: String,
    /// Latest version.
    pub version: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Author.
    #[serde(default)]
    pub author: String,
    /// Relevance as computed by the registry.
    #[serde(default)]
    pub score: f32,
    /// Total download count.
    #[serde(default)]
    pub downloads: u64,
    /// Categories.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Body of `GET /api/v1/plugins/search`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SearchResponse {
    pub(crate) results: Vec<SearchResult>,
}

/// Error body the registry returns alongside non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub(crate) code: Option<String>,
    pub(crate) message: String,
}
