//! HTTP client for the plugin registry.
//!
//! The registry exposes three read-only endpoints:
//!
//! - `GET /api/v1/plugins/search?q=<query>&limit=<n>` → `{ "results": [...] }`
//! - `GET /api/v1/plugins/<name>` → latest [`RegistryPlugin`]
//! - `GET /api/v1/plugins/<name>/<version>` → a specific version
//!
//! Scoped names occupy two path segments (`/plugins/@acme/weather`).

mod types;

use std::time::Duration;

use futures::StreamExt;
use tracing::debug;
use url::Url;

pub use types::{RegistryPlugin, SearchResult};
use types::{ErrorBody, SearchResponse};

use crate::error::{PluginError, PluginResult};

/// Default registry endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.kiln.dev";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bundle size cap (50 MiB).
pub const DEFAULT_MAX_DOWNLOAD: u64 = 50 * 1024 * 1024;

/// Client for one registry endpoint.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base: Url,
    http: reqwest::Client,
    max_download: u64,
}

impl RegistryClient {
    /// Build a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] if the URL does not parse, is not
    /// `http(s)`, or the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration, max_download: u64) -> PluginResult<Self> {
        let base = Url::parse(base_url).map_err(|e| PluginError::Registry {
            message: format!("invalid registry URL '{base_url}': {e}"),
        })?;
        if !matches!(base.scheme(), "https" | "http") || base.cannot_be_a_base() {
            return Err(PluginError::Registry {
                message: format!("registry URL must be http(s): {base_url}"),
            });
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .build()
            .map_err(|e| PluginError::Registry {
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            base,
            http,
            max_download,
        })
    }

    /// Client for [`DEFAULT_REGISTRY_URL`] with default limits.
    ///
    /// # Errors
    ///
    /// See [`RegistryClient::new`].
    pub fn with_defaults() -> PluginResult<Self> {
        Self::new(DEFAULT_REGISTRY_URL, DEFAULT_TIMEOUT, DEFAULT_MAX_DOWNLOAD)
    }

    /// The registry base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Search the registry. Results keep registry order and are truncated to
    /// `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] on transport failure, a non-2xx
    /// status, or an unparseable body.
    pub async fn search(&self, query: &str, limit: usize) -> PluginResult<Vec<SearchResult>> {
        let mut url = self.endpoint(&["search"])?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("limit", &limit.to_string());

        debug!(%url, "registry search");
        let response = self.send(&url).await?;
        let response = check_status(response, query).await?;
        let body: SearchResponse = response.json().await.map_err(|e| PluginError::Registry {
            message: format!("invalid search response: {e}"),
        })?;

        let mut results = body.results;
        results.truncate(limit);
        Ok(results)
    }

    /// Fetch metadata for `name`, at `version` or the latest.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PluginNotFound`] on 404, otherwise
    /// [`PluginError::Registry`].
    pub async fn get(&self, name: &str, version: Option<&str>) -> PluginResult<RegistryPlugin> {
        let mut segments: Vec<&str> = name.split('/').collect();
        if let Some(v) = version {
            segments.push(v);
        }
        let url = self.endpoint(&segments)?;
        let label = match version {
            Some(v) => format!("{name}@{v}"),
            None => name.to_string(),
        };

        debug!(%url, plugin = %label, "registry lookup");
        let response = self.send(&url).await?;
        let response = check_status(response, &label).await?;
        let plugin: RegistryPlugin = response.json().await.map_err(|e| PluginError::Registry {
            message: format!("invalid metadata for {label}: {e}"),
        })?;

        if plugin.name != name {
            return Err(PluginError::Registry {
                message: format!(
                    "registry answered for '{}' when asked for '{name}'",
                    plugin.name
                ),
            });
        }
        Ok(plugin)
    }

    /// Download the bundle for `plugin`, enforcing the size cap.
    ///
    /// The download URL may be relative to the registry. Absolute URLs must
    /// use `https` or share the registry's origin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PackageTooLarge`] when the cap is exceeded and
    /// [`PluginError::FetchFailed`] on any other failure.
    pub async fn download(&self, plugin: &RegistryPlugin) -> PluginResult<Vec<u8>> {
        let label = format!("{}@{}", plugin.name, plugin.version);
        let failed = |message: String| PluginError::FetchFailed {
            source_desc: label.clone(),
            message,
        };

        let url = self
            .base
            .join(&plugin.download_url)
            .map_err(|e| failed(format!("invalid download URL '{}': {e}", plugin.download_url)))?;
        if url.scheme() != "https" && url.origin() != self.base.origin() {
            return Err(failed(format!(
                "refusing download over {} from a foreign origin: {url}",
                url.scheme()
            )));
        }

        debug!(%url, plugin = %label, "downloading bundle");
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| failed(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(failed(format!("download returned {}", response.status())));
        }

        if let Some(len) = response.content_length()
            && len > self.max_download
        {
            return Err(PluginError::PackageTooLarge {
                size: len,
                limit: self.max_download,
            });
        }

        let capacity = usize::try_from(
            response
                .content_length()
                .unwrap_or(0)
                .min(self.max_download),
        )
        .unwrap_or(0);
        let mut bytes = Vec::with_capacity(capacity);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(format!("download error: {e}")))?;
            bytes.extend_from_slice(&chunk);
            let size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
            if size > self.max_download {
                return Err(PluginError::PackageTooLarge {
                    size,
                    limit: self.max_download,
                });
            }
        }
        Ok(bytes)
    }

    fn endpoint(&self, tail: &[&str]) -> PluginResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| PluginError::Registry {
                message: format!("registry URL cannot be a base: {}", self.base),
            })?;
            segments.pop_if_empty();
            segments.extend(["api", "v1", "plugins"]);
            segments.extend(tail);
        }
        Ok(url)
    }

    async fn send(&self, url: &Url) -> PluginResult<reqwest::Response> {
        self.http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PluginError::Registry {
                message: format!("request to {url} failed: {e}"),
            })
    }
}

async fn check_status(response: reqwest::Response, subject: &str) -> PluginResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(PluginError::PluginNotFound(subject.to_string()));
    }
    let detail = match response.json::<ErrorBody>().await {
        Ok(body) => match body.code {
            Some(code) => format!("{code}: {}", body.message),
            None => body.message,
        },
        Err(_) => String::from("no error body"),
    };
    Err(PluginError::Registry {
        message: format!("registry returned {status} for {subject}: {detail}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RegistryClient {
        RegistryClient::new(base, DEFAULT_TIMEOUT, DEFAULT_MAX_DOWNLOAD).unwrap()
    }

    #[test]
    fn endpoint_paths() {
        let c = client("https://registry.example/");
        assert_eq!(
            c.endpoint(&["search"]).unwrap().as_str(),
            "https://registry.example/api/v1/plugins/search"
        );
        assert_eq!(
            c.endpoint(&["@acme", "weather", "1.0.0"]).unwrap().path(),
            "/api/v1/plugins/@acme/weather/1.0.0"
        );
    }

    #[test]
    fn base_with_prefix_is_kept() {
        let c = client("https://example.org/registry");
        assert_eq!(
            c.endpoint(&["hello"]).unwrap().path(),
            "/registry/api/v1/plugins/hello"
        );
    }

    #[test]
    fn rejects_non_http_base() {
        assert!(RegistryClient::new("ftp://x", DEFAULT_TIMEOUT, 1).is_err());
        assert!(RegistryClient::new("not a url", DEFAULT_TIMEOUT, 1).is_err());
    }

    #[tokio::test]
    async fn foreign_plain_http_download_is_refused() {
        let c = client("https://registry.example");
        let plugin = RegistryPlugin {
            name: "x".into(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
            license: None,
            download_url: "http://elsewhere.example/x.tgz".into(),
            sha256: None,
            homepage: None,
            repository: None,
            tags: vec![],
            downloads: 0,
            updated_at: None,
        };
        let err = c.download(&plugin).await.unwrap_err();
        assert!(err.to_string().contains("foreign origin"), "{err}");
    }
}
