//! Unified configuration for Foundry, read from `.foundry/foundry.toml`.
//!
//! Layering is file → environment → CLI. Every key has a default so an empty
//! (or missing) file yields a working configuration.
//!
//! ```toml
//! [workers]
//! max_workers = 3
//! min_poll_interval_ms = 1000
//! max_poll_interval_ms = 60000
//! adaptive_polling = true
//! orphan_cleanup = true
//! failure_cooldown_minutes = 30
//!
//! [worktrees]
//! enabled = true
//! root = "repo"            # repo | sibling | custom
//! max_concurrent = 4
//! cleanup_on_success = "immediate"
//! cleanup_on_failure = "delay"
//!
//! [git]
//! base_branch = "main"
//! branch_pattern = "foundry/card-{id}-{slug}"
//! commit_template = "feat: {title} (card #{id})"
//!
//! [agent]
//! tool = "auto"            # auto | claude | codex
//! timeout_minutes = 30
//!
//! [iterative]
//! enabled = false
//! max_iterations = 5
//! context_carryover = "summary"   # full | summary | none
//!
//! [checks]
//! lint = "cargo clippy -- -D warnings"
//! test = "cargo test"
//!
//! [tracker]
//! provider = "github"      # none | github | gitlab
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard bounds on worker slots per project.
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 8;

/// Lowest poll interval accepted from configuration.
const MIN_POLL_FLOOR_MS: u64 = 100;

/// Where worktrees are created relative to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeRootKind {
    /// `<repo>/.foundry/worktrees`
    #[default]
    Repo,
    /// `<repo-parent>/<repo-name>-worktrees`
    Sibling,
    /// `worktrees.custom_path`
    Custom,
}

/// When to remove a worktree after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupTiming {
    Immediate,
    Delay,
    Never,
}

impl std::fmt::Display for CleanupTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupTiming::Immediate => write!(f, "immediate"),
            CleanupTiming::Delay => write!(f, "delay"),
            CleanupTiming::Never => write!(f, "never"),
        }
    }
}

/// Which AI CLI to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPreference {
    #[default]
    Auto,
    Claude,
    Codex,
}

impl std::fmt::Display for ToolPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolPreference::Auto => write!(f, "auto"),
            ToolPreference::Claude => write!(f, "claude"),
            ToolPreference::Codex => write!(f, "codex"),
        }
    }
}

impl std::str::FromStr for ToolPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ToolPreference::Auto),
            "claude" => Ok(ToolPreference::Claude),
            "codex" => Ok(ToolPreference::Codex),
            _ => anyhow::bail!("Invalid tool '{}'. Valid values: auto, claude, codex", s),
        }
    }
}

/// How much of the previous iteration is carried into the next prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextCarryover {
    Full,
    #[default]
    Summary,
    None,
}

/// Remote tracker (GitHub or GitLab) the project is mirrored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerProvider {
    #[default]
    None,
    Github,
    Gitlab,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub adaptive_polling: bool,
    #[serde(default = "default_true")]
    pub orphan_cleanup: bool,
    /// Minutes a card must wait after a failed attempt before it is picked again.
    #[serde(default = "default_failure_cooldown_minutes")]
    pub failure_cooldown_minutes: u64,
    /// Age after which a running slot with no live pipeline is reclaimed.
    #[serde(default = "default_orphan_threshold_minutes")]
    pub orphan_threshold_minutes: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_lease_renew_secs")]
    pub lease_renew_secs: u64,
}

fn default_max_workers() -> usize {
    2
}

fn default_min_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_poll_interval_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_failure_cooldown_minutes() -> u64 {
    30
}

fn default_orphan_threshold_minutes() -> u64 {
    30
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_lease_renew_secs() -> u64 {
    60
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_poll_interval_ms: default_min_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            adaptive_polling: true,
            orphan_cleanup: true,
            failure_cooldown_minutes: default_failure_cooldown_minutes(),
            orphan_threshold_minutes: default_orphan_threshold_minutes(),
            lease_ttl_secs: default_lease_ttl_secs(),
            lease_renew_secs: default_lease_renew_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub root: WorktreeRootKind,
    #[serde(default)]
    pub custom_path: Option<PathBuf>,
    #[serde(default = "default_max_concurrent_worktrees")]
    pub max_concurrent: usize,
    #[serde(default = "default_cleanup_on_success")]
    pub cleanup_on_success: CleanupTiming,
    #[serde(default = "default_cleanup_on_failure")]
    pub cleanup_on_failure: CleanupTiming,
    /// How long a `cleanup_pending` worktree is kept before the sweep removes it.
    #[serde(default = "default_cleanup_delay_minutes")]
    pub cleanup_delay_minutes: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// On cancellation of a shared-checkout run, hard-reset and return to the
    /// branch that was checked out before the run.
    #[serde(default)]
    pub rollback_on_cancel: bool,
}

fn default_max_concurrent_worktrees() -> usize {
    4
}

fn default_cleanup_on_success() -> CleanupTiming {
    CleanupTiming::Immediate
}

fn default_cleanup_on_failure() -> CleanupTiming {
    CleanupTiming::Delay
}

fn default_cleanup_delay_minutes() -> u64 {
    60
}

fn default_lock_ttl_secs() -> u64 {
    900
}

impl Default for WorktreesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: WorktreeRootKind::Repo,
            custom_path: None,
            max_concurrent: default_max_concurrent_worktrees(),
            cleanup_on_success: default_cleanup_on_success(),
            cleanup_on_failure: default_cleanup_on_failure(),
            cleanup_delay_minutes: default_cleanup_delay_minutes(),
            lock_ttl_secs: default_lock_ttl_secs(),
            rollback_on_cancel: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Placeholders: `{id}`, `{slug}`.
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
    /// Placeholders: `{id}`, `{title}`.
    #[serde(default = "default_commit_template")]
    pub commit_template: String,
    #[serde(default = "default_git_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_pattern() -> String {
    "foundry/card-{id}-{slug}".to_string()
}

fn default_commit_template() -> String {
    "feat: {title} (card #{id})".to_string()
}

fn default_git_timeout_secs() -> u64 {
    300
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            base_branch: default_base_branch(),
            branch_pattern: default_branch_pattern(),
            commit_template: default_commit_template(),
            command_timeout_secs: default_git_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub tool: ToolPreference,
    #[serde(default)]
    pub claude_cmd: Option<String>,
    #[serde(default)]
    pub codex_cmd: Option<String>,
    /// Hard limit for the whole AI phase of one run.
    #[serde(default = "default_agent_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Ask the agent for an implementation plan before the main run.
    #[serde(default = "default_true")]
    pub planning: bool,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
}

fn default_agent_timeout_minutes() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tool: ToolPreference::Auto,
            claude_cmd: None,
            codex_cmd: None,
            timeout_minutes: default_agent_timeout_minutes(),
            allowed_commands: Vec::new(),
            allowed_paths: Vec::new(),
            planning: true,
            skip_permissions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterativeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub context_carryover: ContextCarryover,
}

fn default_max_iterations() -> u32 {
    5
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
            context_carryover: ContextCarryover::Summary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default = "default_checks_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_checks_timeout_minutes() -> u64 {
    15
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            lint: None,
            test: None,
            build: None,
            timeout_minutes: default_checks_timeout_minutes(),
        }
    }
}

impl ChecksConfig {
    /// Configured checks in execution order: lint, test, build.
    pub fn commands(&self) -> Vec<(&'static str, &str)> {
        [("lint", &self.lint), ("test", &self.test), ("build", &self.build)]
            .into_iter()
            .filter_map(|(name, cmd)| {
                cmd.as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(|c| (name, c))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Mirror subtasks as remote sub-issues.
    #[serde(default)]
    pub push_sub_issues: bool,
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
}

fn default_max_subtasks() -> usize {
    8
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            push_sub_issues: false,
            max_subtasks: default_max_subtasks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub provider: TrackerProvider,
    /// `owner/repo` (GitHub) or `group/project` (GitLab). Defaults to the CLI's
    /// own detection from the git remote.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

fn default_label_prefix() -> String {
    "foundry:".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            provider: TrackerProvider::None,
            repo: None,
            label_prefix: default_label_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    /// Import new open remote issues as draft cards.
    #[serde(default = "default_true")]
    pub import_issues: bool,
}

fn default_sync_interval_secs() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sync_interval_secs(),
            import_issues: true,
        }
    }
}

/// The complete foundry.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FoundryToml {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub worktrees: WorktreesConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub iterative: IterativeConfig,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub decomposition: DecompositionConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl FoundryToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foundry.toml")
    }

    /// Load `.foundry/foundry.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(foundry_dir: &Path) -> Result<Self> {
        let config_path = foundry_dir.join("foundry.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foundry.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides (`FOUNDRY_MAX_WORKERS`, `FOUNDRY_TOOL`).
    pub fn apply_env(&mut self) {
        if let Some(n) = std::env::var("FOUNDRY_MAX_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.workers.max_workers = n;
        }
        if let Some(tool) = std::env::var("FOUNDRY_TOOL")
            .ok()
            .and_then(|v| v.parse::<ToolPreference>().ok())
        {
            self.agent.tool = tool;
        }
    }

    /// Worker slots per project, clamped to `[1, 8]`.
    pub fn max_workers(&self) -> usize {
        self.workers.max_workers.clamp(MIN_WORKERS, MAX_WORKERS)
    }

    /// Poll interval bounds after sanitising (`min >= 100ms`, `max >= min`).
    pub fn poll_bounds(&self) -> (Duration, Duration) {
        let min = self.workers.min_poll_interval_ms.max(MIN_POLL_FLOOR_MS);
        let max = self.workers.max_poll_interval_ms.max(min);
        (Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn failure_cooldown(&self) -> Duration {
        minutes(self.workers.failure_cooldown_minutes)
    }

    pub fn orphan_threshold(&self) -> Duration {
        minutes(self.workers.orphan_threshold_minutes)
    }

    pub fn agent_timeout(&self) -> Duration {
        minutes(self.agent.timeout_minutes.max(1))
    }

    pub fn checks_timeout(&self) -> Duration {
        minutes(self.checks.timeout_minutes.max(1))
    }

    /// How long a worktree scheduled for delayed cleanup is kept.
    pub fn cleanup_delay(&self) -> Duration {
        minutes(self.worktrees.cleanup_delay_minutes)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.command_timeout_secs.max(1))
    }

    /// Claude command (file → env → default).
    pub fn claude_cmd(&self) -> String {
        self.agent
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Codex command (file → env → default).
    pub fn codex_cmd(&self) -> String {
        self.agent
            .codex_cmd
            .clone()
            .or_else(|| std::env::var("CODEX_CMD").ok())
            .unwrap_or_else(|| "codex".to_string())
    }

    /// Resolve the directory that holds all worktrees of `repo_root`.
    pub fn worktree_root(&self, repo_root: &Path) -> PathBuf {
        match self.worktrees.root {
            WorktreeRootKind::Repo => repo_root.join(".foundry").join("worktrees"),
            WorktreeRootKind::Sibling => {
                let name = repo_root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "repo".to_string());
                let parent = repo_root.parent().unwrap_or(repo_root);
                parent.join(format!("{}-worktrees", name))
            }
            WorktreeRootKind::Custom => match &self.worktrees.custom_path {
                Some(p) if p.is_absolute() => p.clone(),
                Some(p) => repo_root.join(p),
                None => repo_root.join(".foundry").join("worktrees"),
            },
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers.max_workers) {
            warnings.push(format!(
                "workers.max_workers = {} is outside [{}, {}]; using {}",
                self.workers.max_workers,
                MIN_WORKERS,
                MAX_WORKERS,
                self.max_workers()
            ));
        }
        if self.workers.max_poll_interval_ms < self.workers.min_poll_interval_ms {
            warnings.push(format!(
                "workers.max_poll_interval_ms ({}) is below min_poll_interval_ms ({})",
                self.workers.max_poll_interval_ms, self.workers.min_poll_interval_ms
            ));
        }
        if self.workers.lease_renew_secs >= self.workers.lease_ttl_secs {
            warnings.push(format!(
                "workers.lease_renew_secs ({}) should be shorter than lease_ttl_secs ({})",
                self.workers.lease_renew_secs, self.workers.lease_ttl_secs
            ));
        }
        if self.worktrees.root == WorktreeRootKind::Custom && self.worktrees.custom_path.is_none() {
            warnings.push(
                "worktrees.root = \"custom\" but worktrees.custom_path is not set".to_string(),
            );
        }
        for placeholder in ["{id}"] {
            if !self.git.branch_pattern.contains(placeholder) {
                warnings.push(format!(
                    "git.branch_pattern '{}' lacks {} - branches may collide",
                    self.git.branch_pattern, placeholder
                ));
            }
        }
        for (key, value) in [
            ("workers.failure_cooldown_minutes", self.workers.failure_cooldown_minutes),
            ("workers.orphan_threshold_minutes", self.workers.orphan_threshold_minutes),
            ("worktrees.cleanup_delay_minutes", self.worktrees.cleanup_delay_minutes),
            ("agent.timeout_minutes", self.agent.timeout_minutes),
            ("checks.timeout_minutes", self.checks.timeout_minutes),
        ] {
            if value > MAX_MINUTES {
                warnings.push(format!("{} = {} exceeds one year; using {}", key, value, MAX_MINUTES));
            }
        }
        if self.iterative.enabled && self.iterative.max_iterations == 0 {
            warnings.push("iterative.max_iterations is 0; the AI phase will not run".to_string());
        }

        warnings
    }
}

/// Longest duration any `*_minutes` key may express: one year.
pub const MAX_MINUTES: u64 = 365 * 24 * 60;

/// Capped so deadlines computed from it cannot overflow.
fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.min(MAX_MINUTES) * 60)
}

/// Runtime configuration: a project directory plus its parsed foundry.toml.
#[derive(Debug, Clone)]
pub struct FoundryConfig {
    pub project_dir: PathBuf,
    pub foundry_dir: PathBuf,
    pub toml: FoundryToml,
}

impl FoundryConfig {
    /// Load configuration for `project_dir` with environment overrides applied.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foundry_dir = project_dir.join(".foundry");
        let mut toml = FoundryToml::load_or_default(&foundry_dir)?;
        toml.apply_env();

        Ok(Self {
            project_dir,
            foundry_dir,
            toml,
        })
    }

    /// Apply CLI overrides on top of file and environment values.
    pub fn with_cli_args(project_dir: PathBuf, max_workers: Option<usize>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        if let Some(n) = max_workers {
            config.toml.workers.max_workers = n;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.foundry_dir.join("foundry.toml")
    }

    pub fn db_path(&self) -> PathBuf {
        self.foundry_dir.join("foundry.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.foundry_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}
