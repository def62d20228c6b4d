//! Typed error hierarchy for the Foundry worker engine.
//!
//! One enum per subsystem:
//! - `GitError`: a git invocation that failed (GitOperationError)
//! - `ProcessError`: a supervised subprocess that failed or timed out
//! - `WorktreeError`: worktree isolation and path-safety violations
//! - `PoolError`: slot acquisition and retry exhaustion
//! - `PipelineError`: phase-fatal pipeline failures
//!
//! Cancellation is deliberately absent: it is an outcome, not an error.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A git command that could not be run or exited non-zero.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl GitError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitError::Command { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Failures surfaced by the streaming process runner.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {exit_code}\n--- stdout (tail) ---\n{}\n--- stderr (tail) ---\n{}", .stdout_tail.join("\n"), .stderr_tail.join("\n"))]
    NonZeroExit {
        program: String,
        exit_code: i32,
        stdout_tail: Vec<String>,
        stderr_tail: Vec<String>,
    },

    #[error("{program} timed out after {timeout:?}\n--- stderr (tail) ---\n{}", .stderr_tail.join("\n"))]
    TimedOut {
        program: String,
        timeout: Duration,
        stdout_tail: Vec<String>,
        stderr_tail: Vec<String>,
    },

    #[error("I/O error while supervising {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::TimedOut { .. })
    }

    /// Combined stdout/stderr tails, for diagnostics and error classification.
    pub fn tails(&self) -> String {
        match self {
            ProcessError::NonZeroExit {
                stdout_tail,
                stderr_tail,
                ..
            }
            | ProcessError::TimedOut {
                stdout_tail,
                stderr_tail,
                ..
            } => {
                let mut lines = stdout_tail.clone();
                lines.extend(stderr_tail.iter().cloned());
                lines.join("\n")
            }
            _ => String::new(),
        }
    }

    /// One-line cause plus the stderr tail. Leaves stdout out so program
    /// output cannot be mistaken for the failure reason.
    pub fn failure_summary(&self) -> String {
        match self {
            ProcessError::NonZeroExit {
                program,
                exit_code,
                stderr_tail,
                ..
            } => format!("{} exited with code {}\n{}", program, exit_code, stderr_tail.join("\n")),
            ProcessError::TimedOut {
                program,
                timeout,
                stderr_tail,
                ..
            } => format!("{} timed out after {:?}\n{}", program, timeout, stderr_tail.join("\n")),
            other => other.to_string(),
        }
    }
}

/// Worktree isolation failures. Never swallowed: callers decide whether to
/// recreate or abort.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Refusing to use {} as a worktree: {reason}", .path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Branch '{branch}' is already checked out in worktree {} (requested {})", .existing.display(), .requested.display())]
    BranchCheckedOutElsewhere {
        branch: String,
        existing: PathBuf,
        requested: PathBuf,
    },

    #[error("Worktree {} is already bound to branch '{existing_branch}'", .path.display())]
    PathOccupied {
        path: PathBuf,
        existing_branch: String,
    },

    #[error("Refusing to delete non-empty, unmarked directory {}", .path.display())]
    RefuseToDelete { path: PathBuf },

    #[error("{} is not a registered git worktree", .path.display())]
    NotRegistered { path: PathBuf },

    #[error("Worktree {} is on branch '{actual}', expected '{expected}'", .path.display())]
    BranchMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Worktree path {} does not exist", .path.display())]
    Missing { path: PathBuf },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Worker pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Could not acquire a worker slot for card {card_id} in project {project_id} after {attempts} attempts")]
    SlotAcquisition {
        project_id: i64,
        card_id: i64,
        attempts: u32,
    },

    #[error("Gave up after {attempts} attempts: {last:#}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: anyhow::Error,
    },

    #[error("Pool for project {project_id} is already running")]
    AlreadyRunning { project_id: i64 },

    #[error("No pool running for project {project_id}")]
    NotRunning { project_id: i64 },
}

/// Phase-fatal pipeline failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Phase '{phase}' timed out after {timeout:?}")]
    Timeout { phase: String, timeout: Duration },

    #[error("Card {card_id} not found")]
    CardNotFound { card_id: i64 },

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: i64 },

    #[error("Worktree {} is locked by {holder}", .path.display())]
    WorktreeLocked { path: PathBuf, holder: String },

    #[error("No AI tool is available (preference: {preference})")]
    NoToolAvailable { preference: String },

    #[error("AI run failed: {0}")]
    Agent(String),

    #[error("Nothing to push: branch '{branch}' has no changes relative to {base}")]
    NoChanges { branch: String, base: String },

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
