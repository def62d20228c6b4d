use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OnceCell, OwnedMutexGuard, broadcast};

use crate::config::FoundryToml;
use crate::factory::agent::{AgentTool, ToolSelection, Usage, select_tools};
use crate::factory::db::DbHandle;
use crate::factory::git::{GitVersion, git_version};
use crate::factory::models::{Card, CardStatus, ProgressCheckpoint, Project, Subtask, SubtaskStatus};
use crate::factory::sync_lock::{SyncLock, WorkerGuard};
use crate::factory::tracker::RemoteTracker;
use crate::factory::worktree::WorktreeManager;
use crate::errors::PipelineError;
use crate::util::slugify;

const BRANCH_SLUG_LEN: usize = 40;

/// Phases of one pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    InProgress,
    WorkingTree,
    Fetch,
    Branch,
    Decomposition,
    Plan,
    Ai,
    Checks,
    Push,
    Pr,
    InReview,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::InProgress => "in_progress",
            Phase::WorkingTree => "working_tree",
            Phase::Fetch => "fetch",
            Phase::Branch => "branch",
            Phase::Decomposition => "decomposition",
            Phase::Plan => "plan",
            Phase::Ai => "ai",
            Phase::Checks => "checks",
            Phase::Push => "push",
            Phase::Pr => "pr",
            Phase::InReview => "in_review",
            Phase::Done => "done",
        }
    }

    /// Card statuses under which this phase may start. `Init` is ungated.
    pub fn allowed_statuses(&self) -> &'static [CardStatus] {
        match self {
            Phase::Init => &[],
            Phase::InProgress => &[CardStatus::Ready],
            Phase::Done => &[CardStatus::InReview],
            _ => &[CardStatus::InProgress],
        }
    }

    /// The phase after this one; `Decomposition` only runs when enabled.
    pub fn next(&self, decomposition: bool) -> Option<Phase> {
        Some(match self {
            Phase::Init => Phase::InProgress,
            Phase::InProgress => Phase::WorkingTree,
            Phase::WorkingTree => Phase::Fetch,
            Phase::Fetch => Phase::Branch,
            Phase::Branch if decomposition => Phase::Decomposition,
            Phase::Branch | Phase::Decomposition => Phase::Plan,
            Phase::Plan => Phase::Ai,
            Phase::Ai => Phase::Checks,
            Phase::Checks => Phase::Push,
            Phase::Push => Phase::Pr,
            Phase::Pr => Phase::InReview,
            Phase::InReview => Phase::Done,
            Phase::Done => return None,
        })
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Services shared by every run of one project.
pub struct PipelineEnv {
    pub db: DbHandle,
    pub config: Arc<FoundryToml>,
    pub repo_root: PathBuf,
    pub tools: Vec<Arc<dyn AgentTool>>,
    pub tracker: Option<Arc<dyn RemoteTracker>>,
    pub worktrees: WorktreeManager,
    pub sync_lock: Arc<SyncLock>,
    pub events: broadcast::Sender<String>,
    /// Serializes runs that fall back to the shared checkout.
    pub shared_checkout: Arc<tokio::sync::Mutex<()>>,
    git_version: OnceCell<Option<GitVersion>>,
}

impl PipelineEnv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbHandle,
        config: Arc<FoundryToml>,
        repo_root: impl AsRef<Path>,
        tools: Vec<Arc<dyn AgentTool>>,
        tracker: Option<Arc<dyn RemoteTracker>>,
        sync_lock: Arc<SyncLock>,
        events: broadcast::Sender<String>,
    ) -> Self {
        let repo_root = repo_root.as_ref().to_path_buf();
        let worktrees = WorktreeManager::new(
            &repo_root,
            config.worktree_root(&repo_root),
            config.git.remote.clone(),
            config.git_timeout(),
        );
        Self {
            db,
            config,
            repo_root,
            tools,
            tracker,
            worktrees,
            sync_lock,
            events,
            shared_checkout: Arc::new(tokio::sync::Mutex::new(())),
            git_version: OnceCell::new(),
        }
    }

    /// Installed git version, probed once.
    pub async fn git_version(&self) -> Option<GitVersion> {
        *self
            .git_version
            .get_or_init(|| async {
                match git_version().await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(error = %e, "could not determine git version");
                        None
                    }
                }
            })
            .await
    }

    pub fn select_tools(&self) -> Result<ToolSelection, PipelineError> {
        select_tools(self.config.agent.tool, &self.tools)
    }
}

/// Where the run is making its changes.
#[derive(Clone)]
pub enum Workspace {
    /// An isolated worktree locked in the database by `lock_holder`.
    Worktree {
        path: PathBuf,
        record_id: i64,
        lock_holder: String,
        fresh: bool,
    },
    /// The repository's own checkout, held under the worker side of the
    /// sync lock.
    Shared {
        path: PathBuf,
        original_branch: String,
        stash: Option<String>,
        guards: Arc<SharedGuards>,
    },
}

pub struct SharedGuards {
    pub checkout: OwnedMutexGuard<()>,
    pub worker: WorkerGuard,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        match self {
            Workspace::Worktree { path, .. } | Workspace::Shared { path, .. } => path,
        }
    }

    pub fn is_worktree(&self) -> bool {
        matches!(self, Workspace::Worktree { .. })
    }
}

/// What the AI phase produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AiReport {
    pub tool: String,
    pub usage: Usage,
    pub fallback_used: bool,
    pub iterations: u32,
}

#[derive(Debug, Clone)]
pub struct PrRef {
    pub url: String,
    pub draft: bool,
}

/// Per-run state. Phases never mutate a context in place: each returns a
/// new one through `Step::Continue`.
#[derive(Clone)]
pub struct PipelineContext {
    pub env: Arc<PipelineEnv>,
    pub project: Project,
    pub card: Card,
    pub job_id: i64,
    pub slot_number: i64,
    pub branch: String,
    pub base_ref: String,
    pub workspace: Option<Workspace>,
    pub resume: Option<ProgressCheckpoint>,
    pub subtasks: Vec<Subtask>,
    pub repo_context: String,
    pub plan: Option<String>,
    pub ai: Option<AiReport>,
    /// Last completed AI iteration and the context carried out of it.
    pub iteration: u32,
    pub carryover: Option<String>,
    pub failed_checks: Vec<String>,
    pub pr: Option<PrRef>,
    pub logs: Vec<String>,
}

impl PipelineContext {
    pub fn new(env: Arc<PipelineEnv>, project: Project, card: Card, job_id: i64, slot_number: i64) -> Self {
        let branch = branch_name(&env.config.git.branch_pattern, &card);
        let base_ref = env.config.git.base_branch.clone();
        Self {
            env,
            project,
            card,
            job_id,
            slot_number,
            branch,
            base_ref,
            workspace: None,
            resume: None,
            subtasks: Vec::new(),
            repo_context: String::new(),
            plan: None,
            ai: None,
            iteration: 0,
            carryover: None,
            failed_checks: Vec::new(),
            pr: None,
            logs: Vec::new(),
        }
    }

    pub fn config(&self) -> &FoundryToml {
        &self.env.config
    }

    /// Directory the run operates in; the repository root until a workspace is set.
    pub fn cwd(&self) -> &Path {
        self.workspace
            .as_ref()
            .map(Workspace::path)
            .unwrap_or(&self.env.repo_root)
    }

    pub fn lock_holder(&self) -> String {
        format!("job-{}", self.job_id)
    }

    pub fn stash_message(&self) -> String {
        format!("foundry-autostash-job-{}", self.job_id)
    }

    pub fn completed_subtasks(&self) -> usize {
        self.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .count()
    }

    pub fn checks_passed(&self) -> bool {
        self.failed_checks.is_empty()
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        let line = line.into();
        tracing::info!(job_id = self.job_id, card_id = self.card.id, "{}", line);
        self.logs.push(line);
        self
    }
}

/// Render `git.branch_pattern` for a card (`{id}`, `{slug}`).
pub fn branch_name(pattern: &str, card: &Card) -> String {
    let slug = slugify(&card.title, BRANCH_SLUG_LEN);
    let slug = if slug.is_empty() { "card".to_string() } else { slug };
    pattern
        .replace("{id}", &card.id.to_string())
        .replace("{slug}", &slug)
}

/// Render `git.commit_template` for a card (`{id}`, `{title}`).
pub fn commit_message(template: &str, card: &Card) -> String {
    template
        .replace("{id}", &card.id.to_string())
        .replace("{title}", card.title.trim())
}
