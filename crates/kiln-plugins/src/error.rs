//! Plugin host error types.

use std::fmt;
use std::path::PathBuf;

use kiln_storage::StorageError;

/// Which sandbox quota was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// The interpreter heap ceiling.
    Memory,
    /// The wall-clock quota.
    Timeout,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// Errors from install and execution operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The install source string could not be classified.
    #[error("invalid source '{input}': {reason}")]
    InvalidSource {
        /// The source string as given.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A local source path does not exist or holds no manifest.
    #[error("source not found: {path}: {reason}")]
    SourceNotFound {
        /// The path that was looked up.
        path: PathBuf,
        /// What was missing.
        reason: String,
    },

    /// Network, clone or ref-resolution failure while fetching.
    #[error("fetch failed for {source_desc}: {message}")]
    FetchFailed {
        /// Human-readable source description.
        source_desc: String,
        /// Failure detail.
        message: String,
    },

    /// The downloaded bytes do not match the published checksum.
    #[error("checksum mismatch for {package}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Package that failed verification.
        package: String,
        /// Published digest.
        expected: String,
        /// Digest of the downloaded bytes.
        actual: String,
    },

    /// The plugin descriptor is missing, malformed, or violates a rule.
    #[error("invalid manifest {path}: {reason}")]
    ManifestInvalid {
        /// Manifest path.
        path: PathBuf,
        /// The violated rule.
        reason: String,
    },

    /// Source transformation produced diagnostics.
    #[error("transform failed for {file}:\n{diagnostics}")]
    TransformFailed {
        /// The entry file being transformed.
        file: PathBuf,
        /// Compiler diagnostics, verbatim.
        diagnostics: String,
    },

    /// Dependency bundling failed or the bundler is unavailable.
    #[error("bundle failed: {0}")]
    BundleFailed(String),

    /// No plugin with this identity is installed.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// A capability call was rejected by the permission set.
    #[error("PermissionDenied: {0}")]
    PermissionDenied(String),

    /// A sandbox quota was exceeded; the instance has been discarded.
    #[error("ResourceExceeded({0})")]
    ResourceExceeded(ResourceKind),

    /// The plugin does not declare or export the requested handler.
    #[error("handler not found: {plugin}/{handler}")]
    HandlerNotFound {
        /// Plugin identity.
        plugin: String,
        /// Handler name as requested.
        handler: String,
    },

    /// A handler returned a value that does not match the result shape.
    #[error("invalid result from {handler}: {reason}")]
    InvalidResult {
        /// Handler name.
        handler: String,
        /// Shape violation.
        reason: String,
    },

    /// The plugin identity is malformed.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// The registry returned an error or an unusable response.
    #[error("registry error: {message}")]
    Registry {
        /// Error detail.
        message: String,
    },

    /// A download exceeded the configured size cap.
    #[error("package too large: {size} bytes exceeds limit of {limit} bytes")]
    PackageTooLarge {
        /// Observed size.
        size: u64,
        /// Configured cap.
        limit: u64,
    },

    /// An archive entry or copied path would escape its destination.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// Offending path.
        path: String,
    },

    /// An archive contains links or device entries.
    #[error("unsafe archive entry: {path} ({entry_type})")]
    UnsafeEntryType {
        /// Offending path.
        path: String,
        /// Entry type name.
        entry_type: String,
    },

    /// The interpreter failed outside of any handler (e.g. artifact load).
    #[error("sandbox error for {plugin}: {message}")]
    Sandbox {
        /// Plugin identity.
        plugin: String,
        /// Failure detail.
        message: String,
    },

    /// Lockfile read/write failure.
    #[error("lockfile error at {path}: {message}")]
    Lockfile {
        /// Lockfile path.
        path: PathBuf,
        /// Failure detail.
        message: String,
    },

    /// Filesystem failure during install.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Memory store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PluginError {
    /// Wrap an IO error with context.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error means the sandbox instance must be discarded.
    #[must_use]
    pub fn is_fatal_to_instance(&self) -> bool {
        matches!(self, Self::ResourceExceeded(_) | Self::Sandbox { .. })
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
