//! Git worktree isolation.
//!
//! Each card gets its own checkout under a configured worktree root so
//! several agents can work on one repository at once. Every create and
//! remove is preceded by a path-safety check: only strict subdirectories of
//! the worktree root are writable targets.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::git::{git, local_branch_exists, remote_branch_exists};
use crate::errors::WorktreeError;

/// Tag file written into every worktree this engine creates. A leftover
/// directory carrying it may be deleted even when git no longer knows it.
pub const MARKER_FILE: &str = ".foundry-worktree";

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name; `None` when detached or bare.
    pub branch: Option<String>,
    pub bare: bool,
}

pub fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path.trim()),
                head: None,
                branch: None,
                bare: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.trim().to_string());
            } else if let Some(reference) = line.strip_prefix("branch ") {
                let reference = reference.trim();
                entry.branch = Some(
                    reference
                        .strip_prefix("refs/heads/")
                        .unwrap_or(reference)
                        .to_string(),
                );
            } else if line == "bare" {
                entry.bare = true;
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

/// Lexically normalize `path`, then canonicalize its longest existing
/// prefix so symlinked temp dirs compare equal to what git reports.
pub fn resolve_path(path: &Path) -> PathBuf {
    let mut lexical = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                lexical.pop();
            }
            Component::CurDir => {}
            other => lexical.push(other.as_os_str()),
        }
    }

    let mut existing = lexical.clone();
    let mut rest: Vec<OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                rest.push(name.to_owned());
                existing.pop();
            }
            None => break,
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for name in rest.iter().rev() {
        resolved.push(name);
    }
    resolved
}

/// How a worktree was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationVerb {
    /// Path and branch already matched a healthy worktree.
    Reused,
    /// Checked out an existing local branch.
    ExistingBranch,
    /// Created a local branch tracking the remote one.
    TrackRemote,
    /// Branched fresh from the base branch.
    FromBase,
}

#[derive(Debug, Clone)]
pub struct EnsuredWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub verb: CreationVerb,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_root: PathBuf,
    remote: String,
    timeout: Duration,
}

impl WorktreeManager {
    pub fn new(
        repo_root: impl AsRef<Path>,
        worktree_root: impl AsRef<Path>,
        remote: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo_root: resolve_path(repo_root.as_ref()),
            worktree_root: resolve_path(worktree_root.as_ref()),
            remote: remote.into(),
            timeout,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// Conventional location for a card's worktree.
    pub fn path_for_card(&self, card_id: i64) -> PathBuf {
        self.worktree_root.join(format!("card-{}", card_id))
    }

    /// Resolve `path` (relative paths are taken against the repository
    /// root) and check it is a strict subdirectory of the worktree root.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, WorktreeError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        };
        let resolved = resolve_path(&absolute);
        let reject = |reason: &str| WorktreeError::InvalidPath {
            path: resolved.clone(),
            reason: reason.to_string(),
        };

        if resolved == self.repo_root {
            return Err(reject("it is the repository root"));
        }
        if self.repo_root.starts_with(&resolved) {
            return Err(reject("it is an ancestor of the repository root"));
        }
        if resolved == self.worktree_root {
            return Err(reject("it is the worktree root itself"));
        }
        if !resolved.starts_with(&self.worktree_root) {
            return Err(reject(&format!(
                "it is outside the worktree root {}",
                self.worktree_root.display()
            )));
        }
        Ok(resolved)
    }

    pub fn is_valid_worktree_path(&self, path: &Path) -> bool {
        self.validate_path(path).is_ok()
    }

    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, WorktreeError> {
        let out = git(
            &self.repo_root,
            &["worktree", "list", "--porcelain"],
            self.timeout,
        )
        .await?;
        Ok(parse_worktree_list(&out)
            .into_iter()
            .map(|mut e| {
                e.path = resolve_path(&e.path);
                e
            })
            .collect())
    }

    /// Make sure `path` is a healthy worktree on `branch`.
    ///
    /// - `branch` checked out at exactly `path`: verified and reused.
    /// - `branch` checked out anywhere else: error, nothing touched.
    /// - `path` holding another branch: error unless `force`, which
    ///   removes it first.
    /// - Otherwise the branch is checked out (local), tracked (remote only)
    ///   or created from `base_branch`.
    pub async fn ensure_worktree(
        &self,
        path: &Path,
        branch: &str,
        base_branch: &str,
        force: bool,
    ) -> Result<EnsuredWorktree, WorktreeError> {
        let path = self.validate_path(path)?;
        let entries = self.list_worktrees().await?;

        if let Some(existing) = entries
            .iter()
            .find(|e| e.branch.as_deref() == Some(branch))
        {
            if existing.path != path {
                return Err(WorktreeError::BranchCheckedOutElsewhere {
                    branch: branch.to_string(),
                    existing: existing.path.clone(),
                    requested: path,
                });
            }
            self.verify_worktree(&path, Some(branch)).await?;
            tracing::debug!(path = %path.display(), branch, "reusing worktree");
            return Ok(EnsuredWorktree {
                path,
                branch: branch.to_string(),
                verb: CreationVerb::Reused,
            });
        }

        if let Some(occupant) = entries.iter().find(|e| e.path == path) {
            let existing_branch = occupant
                .branch
                .clone()
                .unwrap_or_else(|| "(detached)".to_string());
            if !force {
                return Err(WorktreeError::PathOccupied {
                    path,
                    existing_branch,
                });
            }
            tracing::warn!(path = %path.display(), %existing_branch, branch, "force-replacing worktree");
            self.remove_worktree(&path, true).await?;
        } else if path.exists() {
            // Unregistered leftover: only empty or marker-tagged dirs go.
            self.remove_leftover(&path)?;
            self.prune().await?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorktreeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let path_str = path.to_string_lossy().to_string();
        let verb = if local_branch_exists(&self.repo_root, branch, self.timeout).await? {
            git(
                &self.repo_root,
                &["worktree", "add", &path_str, branch],
                self.timeout,
            )
            .await?;
            CreationVerb::ExistingBranch
        } else if remote_branch_exists(&self.repo_root, &self.remote, branch, self.timeout).await? {
            let upstream = format!("{}/{}", self.remote, branch);
            git(
                &self.repo_root,
                &["worktree", "add", "--track", "-b", branch, &path_str, &upstream],
                self.timeout,
            )
            .await?;
            CreationVerb::TrackRemote
        } else {
            let base = self.resolve_base(base_branch).await?;
            git(
                &self.repo_root,
                &["worktree", "add", "-b", branch, &path_str, &base],
                self.timeout,
            )
            .await?;
            CreationVerb::FromBase
        };

        self.ensure_excludes().await?;
        let marker = path.join(MARKER_FILE);
        std::fs::write(&marker, format!("branch={}\n", branch)).map_err(|source| {
            WorktreeError::Io {
                path: marker.clone(),
                source,
            }
        })?;

        self.verify_worktree(&path, Some(branch)).await?;
        tracing::info!(path = %path.display(), branch, verb = ?verb, "worktree ready");
        Ok(EnsuredWorktree {
            path,
            branch: branch.to_string(),
            verb,
        })
    }

    /// Prefer the freshest base: `remote/base` when it is known locally.
    async fn resolve_base(&self, base_branch: &str) -> Result<String, WorktreeError> {
        if remote_branch_exists(&self.repo_root, &self.remote, base_branch, self.timeout).await? {
            Ok(format!("{}/{}", self.remote, base_branch))
        } else {
            Ok(base_branch.to_string())
        }
    }

    /// Confirm `path` exists, is a registered worktree and, when given, is
    /// on `expected_branch`.
    pub async fn verify_worktree(
        &self,
        path: &Path,
        expected_branch: Option<&str>,
    ) -> Result<(), WorktreeError> {
        let path = resolve_path(path);
        if !path.exists() {
            return Err(WorktreeError::Missing { path });
        }
        let entries = self.list_worktrees().await?;
        let Some(entry) = entries.iter().find(|e| e.path == path) else {
            return Err(WorktreeError::NotRegistered { path });
        };
        if let Some(expected) = expected_branch {
            let actual = entry.branch.as_deref().unwrap_or("(detached)");
            if actual != expected {
                return Err(WorktreeError::BranchMismatch {
                    path,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Remove a worktree.
    ///
    /// Registered worktrees go through `git worktree remove`; a failure
    /// falls back to deleting the directory only when `force` is set.
    /// Unregistered directories are deleted only when empty or tagged with
    /// the marker file.
    pub async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), WorktreeError> {
        let path = self.validate_path(path)?;
        if !path.exists() {
            self.prune().await?;
            return Ok(());
        }

        let registered = self.list_worktrees().await?.iter().any(|e| e.path == path);
        if !registered {
            self.remove_leftover(&path)?;
            return self.prune().await;
        }

        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        match git(&self.repo_root, &args, self.timeout).await {
            Ok(_) => {
                tracing::info!(path = %path.display(), "worktree removed");
                Ok(())
            }
            Err(e) if force => {
                tracing::warn!(path = %path.display(), error = %e, "git worktree remove failed, deleting directory");
                std::fs::remove_dir_all(&path).map_err(|source| WorktreeError::Io {
                    path: path.clone(),
                    source,
                })?;
                self.prune().await
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove_leftover(&self, path: &Path) -> Result<(), WorktreeError> {
        let io = |source| WorktreeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let empty = std::fs::read_dir(path).map_err(io)?.next().is_none();
        let marked = path.join(MARKER_FILE).is_file();
        if !empty && !marked {
            return Err(WorktreeError::RefuseToDelete {
                path: path.to_path_buf(),
            });
        }
        tracing::debug!(path = %path.display(), empty, marked, "deleting leftover worktree directory");
        std::fs::remove_dir_all(path).map_err(io)
    }

    pub async fn prune(&self) -> Result<(), WorktreeError> {
        git(&self.repo_root, &["worktree", "prune"], self.timeout).await?;
        Ok(())
    }

    /// Keep engine files out of `git status` in every checkout.
    pub async fn ensure_excludes(&self) -> Result<(), WorktreeError> {
        let common = git(
            &self.repo_root,
            &["rev-parse", "--git-common-dir"],
            self.timeout,
        )
        .await?;
        let common = PathBuf::from(common);
        let common = if common.is_absolute() {
            common
        } else {
            self.repo_root.join(common)
        };
        let exclude = common.join("info").join("exclude");
        let io = |source| WorktreeError::Io {
            path: exclude.clone(),
            source,
        };
        let mut content = std::fs::read_to_string(&exclude).unwrap_or_default();
        let mut changed = false;
        for pattern in [".foundry/", MARKER_FILE] {
            if !content.lines().any(|l| l.trim() == pattern) {
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(pattern);
                content.push('\n');
                changed = true;
            }
        }
        if changed {
            if let Some(parent) = exclude.parent() {
                std::fs::create_dir_all(parent).map_err(io)?;
            }
            std::fs::write(&exclude, content).map_err(io)?;
        }
        Ok(())
    }
}
