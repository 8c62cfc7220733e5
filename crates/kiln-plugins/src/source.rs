//! Install source classification.
//!
//! Turns the string a user passes to `kiln install` into a [`FetchPlan`].
//! Resolution never touches the network and never writes; the only side
//! effect is a metadata lookup to decide whether a bare string names an
//! existing directory.
//!
//! Accepted forms, tried in order:
//!
//! 1. Repository sources: `git+https://…`, `git+ssh://…`, `git+file://…`,
//!    `git@host:org/repo.git`, any `https://` or `ssh://` URL ending in
//!    `.git`, or a URL on a known forge host. An optional `#ref` names a
//!    branch, tag or commit.
//! 2. Local paths: anything that exists on disk, or that is spelled like a
//!    path (`/…`, `./…`, `../…`, `~/…`).
//! 3. Registry names: `name`, `@scope/name`, or the deprecated `scope/name`,
//!    each with an optional `@version` suffix.

use std::fmt;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::warn;

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// Forge hosts whose URLs are treated as repositories even without `.git`.
const KNOWN_FORGES: &[&str] = &["github.com", "gitlab.com", "bitbucket.org", "codeberg.org"];

/// Where to fetch a plugin from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    /// Download a published bundle.
    Registry {
        /// Normalized identity.
        id: PluginId,
        /// Pinned version; `None` means latest.
        version: Option<String>,
    },
    /// Clone a repository.
    Git {
        /// Clone URL as handed to `git`.
        url: String,
        /// Branch, tag or commit.
        reference: Option<String>,
    },
    /// Copy a directory on this machine.
    Local {
        /// Path as given (not canonicalized).
        path: PathBuf,
    },
}

impl FetchPlan {
    /// Short human-readable description, used in logs and errors.
    #[must_use]
    pub fn describe(&self) -> String {
        self.to_string()
    }

    /// Source kind label (`registry`, `git`, `local`).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry { .. } => "registry",
            Self::Git { .. } => "git",
            Self::Local { .. } => "local",
        }
    }
}

impl fmt::Display for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { id, version: None } => write!(f, "registry:{id}"),
            Self::Registry {
                id,
                version: Some(v),
            } => write!(f, "registry:{id}@{v}"),
            Self::Git {
                url,
                reference: None,
            } => write!(f, "git:{url}"),
            Self::Git {
                url,
                reference: Some(r),
            } => write!(f, "git:{url}#{r}"),
            Self::Local { path } => write!(f, "local:{}", path.display()),
        }
    }
}

/// Classify `input`, applying an explicit `--version` if given.
///
/// # Errors
///
/// Returns [`PluginError::InvalidSource`] if the string matches no form,
/// uses a disallowed scheme, carries an unsafe ref, or pins two different
/// versions.
pub fn resolve(input: &str, version: Option<&str>) -> PluginResult<FetchPlan> {
    let trimmed = input.trim();
    let invalid = |reason: String| PluginError::InvalidSource {
        input: input.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("source must not be empty".into()));
    }

    if let Some(plan) = resolve_git(trimmed).map_err(&invalid)? {
        if version.is_some() {
            return Err(invalid(
                "--version applies to registry sources; use #ref for repositories".into(),
            ));
        }
        return Ok(plan);
    }

    if looks_like_path(trimmed) || Path::new(trimmed).exists() {
        if version.is_some() {
            return Err(invalid("--version applies to registry sources".into()));
        }
        return Ok(FetchPlan::Local {
            path: expand_home(trimmed),
        });
    }

    resolve_registry(trimmed, version).map_err(&invalid)
}

/// Returns `Ok(None)` when the input is not a repository source at all.
fn resolve_git(input: &str) -> Result<Option<FetchPlan>, String> {
    let (location, reference) = split_fragment(input);

    if let Some(rest) = location.strip_prefix("git+") {
        let scheme_ok = ["https://", "ssh://", "file://"]
            .iter()
            .any(|s| rest.starts_with(s));
        if !scheme_ok {
            return Err(format!(
                "unsupported repository scheme in '{rest}': expected https://, ssh:// or file://"
            ));
        }
        return git_plan(rest, reference).map(Some);
    }

    // `git@1.0.0` is a registry plugin named `git`, not scp syntax.
    if let Some(rest) = location.strip_prefix("git@")
        && let Some((host, path)) = rest.split_once(':')
    {
        if host.is_empty() || path.is_empty() || host.contains('/') {
            return Err("scp-style repository must look like git@host:path".into());
        }
        return git_plan(location, reference).map(Some);
    }

    if let Some((scheme, rest)) = location.split_once("://") {
        return match scheme {
            "https" | "ssh" => {
                if location.ends_with(".git") || is_forge_url(rest) {
                    git_plan(location, reference).map(Some)
                } else {
                    Err(format!(
                        "'{location}' is neither a .git URL nor on a known forge ({})",
                        KNOWN_FORGES.join(", ")
                    ))
                }
            },
            "http" | "git" => Err(format!(
                "insecure scheme '{scheme}://' is not allowed; use https:// or ssh://"
            )),
            other => Err(format!("unsupported scheme '{other}://'")),
        };
    }

    // `github.com/org/repo` without a scheme.
    if is_forge_url(location) {
        return git_plan(&format!("https://{location}"), reference).map(Some);
    }

    if location.ends_with(".git") && !looks_like_path(location) {
        return Err(format!(
            "repository '{location}' needs a scheme (https://, ssh:// or git@host:)"
        ));
    }

    if reference.is_some() && !looks_like_path(location) {
        return Err("'#ref' is only valid on repository sources".into());
    }

    Ok(None)
}

fn git_plan(url: &str, reference: Option<&str>) -> Result<FetchPlan, String> {
    if url.chars().any(char::is_whitespace) {
        return Err("repository URL must not contain whitespace".into());
    }
    if let Some(r) = reference {
        validate_git_ref(r)?;
    }
    Ok(FetchPlan::Git {
        url: url.to_string(),
        reference: reference.map(str::to_string),
    })
}

/// Split `value#fragment`; an empty fragment counts as none.
fn split_fragment(input: &str) -> (&str, Option<&str>) {
    match input.split_once('#') {
        Some((loc, frag)) if !frag.is_empty() => (loc, Some(frag)),
        Some((loc, _)) => (loc, None),
        None => (input, None),
    }
}

/// `rest` is the part after `scheme://` (or the whole string when there is
/// no scheme). Requires at least `host/owner/repo`.
fn is_forge_url(rest: &str) -> bool {
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let host = authority
        .rsplit_once('@')
        .map_or(authority, |(_, h)| h)
        .split(':')
        .next()
        .unwrap_or_default();
    if !KNOWN_FORGES.contains(&host) {
        return false;
    }
    rest[authority_end..]
        .split('/')
        .filter(|s| !s.is_empty())
        .count()
        >= 2
}

fn looks_like_path(input: &str) -> bool {
    input == "."
        || input == ".."
        || input.starts_with('/')
        || input.starts_with("./")
        || input.starts_with("../")
        || input.starts_with("~/")
}

fn expand_home(input: &str) -> PathBuf {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(dirs) = directories::BaseDirs::new()
    {
        return dirs.home_dir().join(rest);
    }
    PathBuf::from(input)
}

fn resolve_registry(input: &str, flag_version: Option<&str>) -> Result<FetchPlan, String> {
    let (raw_name, suffix_version) = split_version(input);

    let name = if raw_name.starts_with('@') {
        raw_name.to_string()
    } else if let Some((scope, name)) = raw_name.split_once('/') {
        let normalized = format!("@{scope}/{name}");
        warn!(
            source = input,
            normalized = %normalized,
            "unscoped 'scope/name' form is deprecated; use '@scope/name'"
        );
        normalized
    } else {
        raw_name.to_string()
    };

    let id = PluginId::new(name).map_err(|e| e.to_string())?;

    let version = match (suffix_version, flag_version) {
        (Some(a), Some(b)) if a != b => {
            return Err(format!("conflicting versions '{a}' and '{b}'"));
        },
        (Some(v), _) | (None, Some(v)) => normalize_version(v)?,
        (None, None) => None,
    };

    Ok(FetchPlan::Registry { id, version })
}

/// Split `name@version`, skipping the `@` that introduces a scope.
fn split_version(input: &str) -> (&str, Option<&str>) {
    let search_from = usize::from(input.starts_with('@'));
    match input[search_from..].rfind('@') {
        Some(pos) => {
            let at = pos.saturating_add(search_from);
            let version = &input[at.saturating_add(1)..];
            if version.is_empty() {
                (&input[..at], None)
            } else {
                (&input[..at], Some(version))
            }
        },
        None => (input, None),
    }
}

fn normalize_version(v: &str) -> Result<Option<String>, String> {
    if v == "latest" {
        return Ok(None);
    }
    let v = v.strip_prefix('v').unwrap_or(v);
    Version::parse(v)
        .map(|parsed| Some(parsed.to_string()))
        .map_err(|e| format!("version '{v}' is not a semantic version: {e}"))
}

/// Refs reach `git` as arguments, so they are held to a conservative
/// subset of git's ref grammar.
pub(crate) fn validate_git_ref(reference: &str) -> Result<(), String> {
    if reference.is_empty() || reference.len() > 256 {
        return Err("git ref must be 1-256 characters".into());
    }
    if reference.starts_with('-') {
        return Err(format!("git ref must not start with '-': '{reference}'"));
    }
    if reference.contains("..") || reference.contains("//") {
        return Err(format!("git ref has invalid format: '{reference}'"));
    }
    let charset_ok = reference
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/'));
    if !charset_ok {
        return Err(format!("git ref contains invalid characters: '{reference}'"));
    }
    if reference.starts_with(['.', '/'])
        || reference.ends_with(['.', '/'])
        || reference.ends_with(".lock")
    {
        return Err(format!("git ref has invalid format: '{reference}'"));
    }
    Ok(())
}

/// Whether a ref looks like an abbreviated or full commit hash.
#[must_use]
pub fn is_commit_hash(reference: &str) -> bool {
    (7..=40).contains(&reference.len()) && reference.bytes().all(|b| b.is_ascii_hexdigit())
}
