//! Thin async wrappers over the `git` CLI.
//!
//! Short queries use `git()`, which captures output under a timeout.
//! Long-running, cancelable operations (fetch, push, rebase) go through
//! `git_streaming()`, which delegates to the process runner.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use super::cancel::CancelSignal;
use super::process::{LineLogger, ProcessOutcome, ProcessSpec, run_streaming};
use crate::errors::{GitError, ProcessError};

/// Oldest git release with the worktree features the manager relies on.
pub const MIN_WORKTREE_VERSION: GitVersion = GitVersion {
    major: 2,
    minor: 17,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl GitVersion {
    pub fn supports_worktrees(&self) -> bool {
        *self >= MIN_WORKTREE_VERSION
    }
}

impl std::fmt::Display for GitVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse `git --version` output, e.g. `git version 2.39.3 (Apple Git-145)`.
pub fn parse_git_version(output: &str) -> Option<GitVersion> {
    let version = output
        .split_whitespace()
        .find(|word| word.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let mut parts = version.split('.').map(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .ok()
    });
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some(GitVersion {
        major,
        minor,
        patch,
    })
}

pub async fn git_version() -> Result<GitVersion, GitError> {
    let out = git(&std::env::temp_dir(), &["--version"], Duration::from_secs(10)).await?;
    parse_git_version(&out).ok_or_else(|| GitError::Command {
        command: "git --version".into(),
        exit_code: 0,
        stderr: format!("unrecognized version string: {}", out),
    })
}

fn render(args: &[&str]) -> String {
    format!("git {}", args.join(" "))
}

/// Run a git command and return its trimmed stdout.
pub async fn git(cwd: &Path, args: &[&str], timeout: Duration) -> Result<String, GitError> {
    let command = render(args);
    let child = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?,
        Err(_) => return Err(GitError::Timeout { command, timeout }),
    };

    if !output.status.success() {
        return Err(GitError::Command {
            command,
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a git command whose non-zero exit is an answer rather than a failure
/// (`show-ref --verify`, `diff --quiet`). Returns `Ok(false)` for exit code 1.
pub async fn git_probe(cwd: &Path, args: &[&str], timeout: Duration) -> Result<bool, GitError> {
    match git(cwd, args, timeout).await {
        Ok(_) => Ok(true),
        Err(GitError::Command { exit_code: 1, .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run a long git operation through the streaming process runner so it can
/// be canceled mid-flight.
pub async fn git_streaming(
    cwd: &Path,
    args: &[&str],
    timeout: Duration,
    cancel: &CancelSignal,
    logger: &LineLogger,
) -> Result<ProcessOutcome, GitError> {
    let spec = ProcessSpec::new("git", cwd, timeout).args(args.iter().copied());
    let command = render(args);
    run_streaming(&spec, cancel, logger)
        .await
        .map_err(|e| match e {
            ProcessError::NonZeroExit {
                exit_code,
                stderr_tail,
                ..
            } => GitError::Command {
                command,
                exit_code,
                stderr: stderr_tail.join("\n"),
            },
            ProcessError::TimedOut { timeout, .. } => GitError::Timeout { command, timeout },
            ProcessError::Spawn { source, .. } | ProcessError::Io { source, .. } => {
                GitError::Spawn { command, source }
            }
        })
}

pub async fn current_branch(cwd: &Path, timeout: Duration) -> Result<String, GitError> {
    git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"], timeout).await
}

pub async fn head_sha(cwd: &Path, timeout: Duration) -> Result<String, GitError> {
    git(cwd, &["rev-parse", "HEAD"], timeout).await
}

pub async fn local_branch_exists(cwd: &Path, branch: &str, timeout: Duration) -> Result<bool, GitError> {
    let reference = format!("refs/heads/{}", branch);
    git_probe(cwd, &["show-ref", "--verify", "--quiet", &reference], timeout).await
}

/// Whether `remote/branch` is known locally (as of the last fetch).
pub async fn remote_branch_exists(
    cwd: &Path,
    remote: &str,
    branch: &str,
    timeout: Duration,
) -> Result<bool, GitError> {
    let reference = format!("refs/remotes/{}/{}", remote, branch);
    git_probe(cwd, &["show-ref", "--verify", "--quiet", &reference], timeout).await
}

pub async fn remote_exists(cwd: &Path, remote: &str, timeout: Duration) -> Result<bool, GitError> {
    let remotes = git(cwd, &["remote"], timeout).await?;
    Ok(remotes.lines().any(|r| r.trim() == remote))
}

pub async fn is_dirty(cwd: &Path, timeout: Duration) -> Result<bool, GitError> {
    let status = git(cwd, &["status", "--porcelain"], timeout).await?;
    Ok(!status.is_empty())
}

/// Stage everything and commit. Returns false when there was nothing to commit.
pub async fn commit_all(cwd: &Path, message: &str, timeout: Duration) -> Result<bool, GitError> {
    git(cwd, &["add", "-A"], timeout).await?;
    let clean = git_probe(cwd, &["diff", "--cached", "--quiet"], timeout).await?;
    if clean {
        return Ok(false);
    }
    git(cwd, &["commit", "--no-verify", "-m", message], timeout).await?;
    Ok(true)
}

/// Number of commits on HEAD that `base` does not have.
pub async fn commits_ahead(cwd: &Path, base: &str, timeout: Duration) -> Result<u64, GitError> {
    let range = format!("{}..HEAD", base);
    let count = git(cwd, &["rev-list", "--count", &range], timeout).await?;
    Ok(count.parse().unwrap_or(0))
}

/// Stash all local changes (including untracked files) under `message`.
/// Returns false when the tree was clean and nothing was stashed.
pub async fn stash_push(cwd: &Path, message: &str, timeout: Duration) -> Result<bool, GitError> {
    if !is_dirty(cwd, timeout).await? {
        return Ok(false);
    }
    git(cwd, &["stash", "push", "--include-untracked", "-m", message], timeout).await?;
    Ok(true)
}

/// Pop the stash entry created with `message`, wherever it now sits in the
/// stash list. Returns false if no such entry exists.
pub async fn stash_pop(cwd: &Path, message: &str, timeout: Duration) -> Result<bool, GitError> {
    let list = git(cwd, &["stash", "list", "--format=%gd %s"], timeout).await?;
    let Some(reference) = list
        .lines()
        .find(|line| line.ends_with(message))
        .and_then(|line| line.split_whitespace().next())
    else {
        return Ok(false);
    };
    git(cwd, &["stash", "pop", reference], timeout).await?;
    Ok(true)
}
