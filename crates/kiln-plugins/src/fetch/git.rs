//! Repository fetches through the system `git`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::source::is_commit_hash;

/// Upper bound on one clone, including checkout.
pub(crate) const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Clone `url` into `dest/repo` and return `(checkout_dir, commit)`.
///
/// Branch and tag refs use a shallow clone. A commit hash needs history, so
/// it gets a full clone followed by a detached checkout.
pub(super) async fn clone(
    url: &str,
    reference: Option<&str>,
    dest: &Path,
) -> PluginResult<(PathBuf, String)> {
    let checkout = dest.join("repo");
    tokio::time::timeout(GIT_TIMEOUT, clone_inner(url, reference, &checkout))
        .await
        .map_err(|_| PluginError::FetchFailed {
            source_desc: url.to_string(),
            message: format!("git clone timed out after {}s", GIT_TIMEOUT.as_secs()),
        })??;

    let commit = run_git(url, Some(&checkout), &["rev-parse", "HEAD"]).await?;
    let commit = commit.trim().to_string();
    debug!(url, commit = %commit, "cloned repository");
    Ok((checkout, commit))
}

async fn clone_inner(url: &str, reference: Option<&str>, checkout: &Path) -> PluginResult<()> {
    let target = checkout.to_string_lossy();
    match reference {
        Some(commit) if is_commit_hash(commit) => {
            run_git(url, None, &["clone", "--no-checkout", "--", url, &target]).await?;
            run_git(url, Some(checkout), &["checkout", "--detach", commit]).await?;
        },
        Some(branch) => {
            run_git(
                url,
                None,
                &["clone", "--depth", "1", "--branch", branch, "--", url, &target],
            )
            .await?;
        },
        None => {
            run_git(url, None, &["clone", "--depth", "1", "--", url, &target]).await?;
        },
    }
    Ok(())
}

/// Run git with a scrubbed environment and return stdout.
///
/// Inherited variables such as `GIT_SSH_COMMAND` or `GIT_PROXY_COMMAND`
/// could run arbitrary programs, so only `PATH` and `HOME` survive, global
/// and system config are ignored, and prompts are disabled.
async fn run_git(url: &str, cwd: Option<&Path>, args: &[&str]) -> PluginResult<String> {
    let mut cmd = Command::new("git");
    cmd.env_clear();
    for var in ["PATH", "HOME"] {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }
    cmd.env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args);

    let output = cmd.output().await.map_err(|e| PluginError::FetchFailed {
        source_desc: url.to_string(),
        message: format!("failed to run git: {e}"),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PluginError::FetchFailed {
            source_desc: url.to_string(),
            message: format!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
