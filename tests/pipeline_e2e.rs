//! End-to-end pipeline runs against scratch git repositories.
//!
//! The agent and tracker are in-process fakes; git, worktrees, checks and
//! pushes are real.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use foundry::config::FoundryToml;
use foundry::factory::agent::{AgentResponse, AgentRun, AgentTool, Usage};
use foundry::factory::cancel::CancelSignal;
use foundry::factory::db::{DbHandle, FactoryDb};
use foundry::factory::events;
use foundry::factory::models::{
    Card, CardStatus, Job, JobState, JobType, Project, SlotClaim, SlotStatus, SubtaskStatus, WorktreeStatus,
};
use foundry::factory::pipeline::{Phase, PipelineEnv, PipelineRequest, PipelineResult, WorkerPipeline};
use foundry::factory::process::LineLogger;
use foundry::factory::sync_lock::SyncLock;
use foundry::factory::tracker::{NewPullRequest, PullRequest, RemoteIssue, RemoteTracker};

// =============================================================================
// Helpers
// =============================================================================

fn git(cwd: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A repository on `main` with one commit, pushed to a bare `origin`.
fn repo_with_origin() -> (TempDir, TempDir) {
    let repo = TempDir::new().unwrap();
    let path = repo.path();
    git(path, &["init", "-q"]);
    git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(path, &["config", "user.email", "foundry@example.com"]);
    git(path, &["config", "user.name", "Foundry Test"]);
    git(path, &["config", "commit.gpgsign", "false"]);
    std::fs::write(path.join("README.md"), "# demo\n").unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "-q", "-m", "initial"]);

    let origin = TempDir::new().unwrap();
    git(origin.path(), &["init", "-q", "--bare"]);
    let url = origin.path().to_string_lossy().to_string();
    git(path, &["remote", "add", "origin", &url]);
    git(path, &["push", "-q", "-u", "origin", "main"]);
    (repo, origin)
}

fn test_config() -> FoundryToml {
    let mut config = FoundryToml::default();
    config.agent.planning = false;
    config.git.command_timeout_secs = 60;
    config
}

const AGENT_OUTPUT: &str = "<progress>100%</progress>\n<summary>wrote the file</summary>";

/// Writes a file named after itself into the working directory. Calls
/// past `fail_after` fail with `fail_with`.
struct FakeAgent {
    name: &'static str,
    fail_with: Option<&'static str>,
    fail_after: usize,
    output: &'static str,
    calls: AtomicUsize,
}

impl FakeAgent {
    fn build(
        name: &'static str,
        fail_with: Option<&'static str>,
        fail_after: usize,
        output: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_with,
            fail_after,
            output,
            calls: AtomicUsize::new(0),
        })
    }

    fn ok(name: &'static str) -> Arc<Self> {
        Self::build(name, None, 0, AGENT_OUTPUT)
    }

    fn failing(name: &'static str, error: &'static str) -> Arc<Self> {
        Self::build(name, Some(error), 0, "")
    }

    /// Succeeds `calls` times, then fails with `error`.
    fn failing_after(name: &'static str, calls: usize, error: &'static str) -> Arc<Self> {
        Self::build(name, Some(error), calls, AGENT_OUTPUT)
    }

    /// Fails with `error` while its output chatters about `output`.
    fn failing_with_output(name: &'static str, error: &'static str, output: &'static str) -> Arc<Self> {
        Self::build(name, Some(error), 0, output)
    }
}

#[async_trait]
impl AgentTool for FakeAgent {
    fn name(&self) -> &str {
        self.name
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _prompt: &str,
        cwd: &Path,
        _timeout: Duration,
        _cancel: &CancelSignal,
        _logger: &LineLogger,
    ) -> AgentRun {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_with
            && call >= self.fail_after
        {
            return AgentRun::Completed(AgentResponse {
                output: self.output.to_string(),
                ..AgentResponse::failed(error)
            });
        }
        std::fs::write(cwd.join(format!("{}.txt", self.name)), format!("implemented {}\n", call)).unwrap();
        AgentRun::Completed(AgentResponse {
            success: true,
            output: self.output.to_string(),
            usage: Usage {
                input_tokens: 120,
                output_tokens: 40,
                cost_usd: 0.01,
            },
            error: None,
            timed_out: false,
        })
    }
}

/// Answers the decomposition prompt with two subtasks, then completes one
/// subtask per implementation call.
#[derive(Default)]
struct SubtaskAgent {
    implementation_calls: AtomicUsize,
    decomposition_calls: AtomicUsize,
}

#[async_trait]
impl AgentTool for SubtaskAgent {
    fn name(&self) -> &str {
        "claude"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        _timeout: Duration,
        _cancel: &CancelSignal,
        _logger: &LineLogger,
    ) -> AgentRun {
        if prompt.contains("split a work item") {
            self.decomposition_calls.fetch_add(1, Ordering::SeqCst);
            let output = r#"{"subtasks": [{"title": "Schema", "description": "Done when the table exists"}, {"title": "Endpoint", "description": "Done when it responds"}]}"#;
            return AgentRun::Completed(AgentResponse {
                success: true,
                output: output.to_string(),
                ..Default::default()
            });
        }
        let n = self.implementation_calls.fetch_add(1, Ordering::SeqCst) + 1;
        std::fs::write(cwd.join(format!("part{}.txt", n)), "done\n").unwrap();
        AgentRun::Completed(AgentResponse {
            success: true,
            output: format!("<subtask-complete>{}</subtask-complete>\n<summary>part {} done</summary>", n, n),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                cost_usd: 0.0,
            },
            error: None,
            timed_out: false,
        })
    }
}

#[derive(Default)]
struct FakeTracker {
    created: Mutex<Vec<NewPullRequest>>,
    /// URL of a pull request that already exists for any branch.
    existing: Option<&'static str>,
}

#[async_trait]
impl RemoteTracker for FakeTracker {
    fn provider(&self) -> &str {
        "fake"
    }

    fn label_prefix(&self) -> &str {
        "foundry:"
    }

    async fn check_auth(&self) -> Result<bool> {
        Ok(true)
    }

    async fn list_issues(&self) -> Result<Vec<RemoteIssue>> {
        Ok(Vec::new())
    }

    async fn list_pull_requests(&self, head: &str) -> Result<Vec<PullRequest>> {
        Ok(self
            .existing
            .map(|url| PullRequest {
                number: 7,
                url: url.to_string(),
                head: head.to_string(),
                draft: false,
            })
            .into_iter()
            .collect())
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        let mut created = self.created.lock().unwrap();
        created.push(request.clone());
        let number = created.len() as i64;
        Ok(PullRequest {
            number,
            url: format!("https://example.test/pull/{}", number),
            head: request.head.clone(),
            draft: request.draft,
        })
    }

    async fn update_labels(&self, _issue: i64, _add: &[String], _remove: &[String]) -> Result<()> {
        Ok(())
    }

    async fn comment_on_issue(&self, _issue: i64, _body: &str) -> Result<()> {
        Ok(())
    }

    async fn create_issue(&self, _title: &str, _body: &str, _labels: &[String]) -> Result<i64> {
        Ok(100)
    }
}

struct Harness {
    db: DbHandle,
    pipeline: WorkerPipeline,
    project: Project,
    sync_lock: Arc<SyncLock>,
}

impl Harness {
    fn new(
        repo: &Path,
        config: FoundryToml,
        tools: Vec<Arc<dyn AgentTool>>,
        tracker: Option<Arc<dyn RemoteTracker>>,
    ) -> Self {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let project = db
            .lock_sync()
            .unwrap()
            .create_project("demo", &repo.to_string_lossy())
            .unwrap();
        let sync_lock = SyncLock::new(project.id);
        let env = PipelineEnv::new(
            db.clone(),
            Arc::new(config),
            repo,
            tools,
            tracker,
            sync_lock.clone(),
            events::channel(),
        );
        Self {
            db,
            pipeline: WorkerPipeline::new(Arc::new(env)),
            project,
            sync_lock,
        }
    }

    /// A ready card with a claimed slot and a queued job, as the pool
    /// would hand it over.
    fn claim(&self, title: &str) -> PipelineRequest {
        let db = self.db.lock_sync().unwrap();
        let card = db
            .create_card(self.project.id, title, "Make it so.", CardStatus::Ready)
            .unwrap();
        db.init_slots(self.project.id, 1).unwrap();
        let slot = match db.acquire_idle_slot(self.project.id, card.id, Utc::now()).unwrap() {
            SlotClaim::Acquired(slot) => slot,
            other => panic!("no slot: {:?}", other),
        };
        let job = db
            .create_job(self.project.id, Some(card.id), JobType::AgentRun)
            .unwrap();
        db.assign_slot_job(self.project.id, slot.slot_number, job.id)
            .unwrap();
        PipelineRequest {
            project: self.project.clone(),
            card,
            job_id: job.id,
            slot_number: slot.slot_number,
        }
    }

    async fn run(&self, request: PipelineRequest) -> PipelineResult {
        self.pipeline.run(request, CancellationToken::new()).await
    }

    fn card(&self, id: i64) -> Card {
        self.db.lock_sync().unwrap().get_card(id).unwrap().unwrap()
    }

    fn job(&self, id: i64) -> Job {
        self.db.lock_sync().unwrap().get_job(id).unwrap().unwrap()
    }
}

/// Wait until the run checkpoints `phase`, then apply `action`. Returns
/// when the action ran, or `None` if the phase was never reached.
fn on_phase<F>(
    db: &DbHandle,
    job_id: i64,
    phase: &'static str,
    action: F,
) -> tokio::task::JoinHandle<Option<Instant>>
where
    F: FnOnce(&FactoryDb) -> Result<()> + Send + 'static,
{
    let db = db.clone();
    tokio::spawn(async move {
        for _ in 0..400 {
            let current = db
                .call(move |db| db.get_checkpoint(job_id))
                .await
                .unwrap()
                .map(|cp| cp.phase);
            if current.as_deref() == Some(phase) {
                // Give the phase a moment to start its subprocess.
                tokio::time::sleep(Duration::from_millis(200)).await;
                db.call(action).await.unwrap();
                return Some(Instant::now());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        None
    })
}

/// A repository whose checkout carries an uncommitted edit, for runs that
/// fall back to the shared checkout.
fn dirty_repo_with_origin() -> (TempDir, TempDir) {
    let (repo, origin) = repo_with_origin();
    std::fs::write(repo.path().join("README.md"), "user edit\n").unwrap();
    (repo, origin)
}

fn shared_config() -> FoundryToml {
    let mut config = test_config();
    config.worktrees.enabled = false;
    config
}

const FULL_RUN: [Phase; 12] = [
    Phase::Init,
    Phase::InProgress,
    Phase::WorkingTree,
    Phase::Fetch,
    Phase::Branch,
    Phase::Plan,
    Phase::Ai,
    Phase::Checks,
    Phase::Push,
    Phase::Pr,
    Phase::InReview,
    Phase::Done,
];

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn card_runs_to_review_in_a_worktree() {
    let (repo, origin) = repo_with_origin();
    let tracker = Arc::new(FakeTracker::default());
    let agent = FakeAgent::ok("claude");
    let harness = Harness::new(
        repo.path(),
        test_config(),
        vec![agent.clone()],
        Some(tracker.clone()),
    );
    let request = harness.claim("Add greeting");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert_eq!(result.visited, FULL_RUN);
    assert_eq!(result.pr_url.as_deref(), Some("https://example.test/pull/1"));
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.card(card_id).status, CardStatus::InReview);

    let created = tracker.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert!(!created[0].draft);
    assert_eq!(created[0].base, "main");
    assert!(created[0].head.starts_with(&format!("foundry/card-{}-", card_id)));

    // The branch reached the remote with the agent's file on it.
    let files = git(origin.path(), &["ls-tree", "--name-only", created[0].head.as_str()]);
    assert!(files.lines().any(|f| f == "claude.txt"), "files: {}", files);

    // The shared checkout was never touched.
    assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    assert!(!repo.path().join("claude.txt").exists());

    let db = harness.db.lock_sync().unwrap();
    let job = db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    let slot = db.get_slot(harness.project.id, 1).unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Idle);
}

#[tokio::test]
async fn rate_limited_primary_falls_back_once() {
    let (repo, _origin) = repo_with_origin();
    let primary = FakeAgent::failing("claude", "API error: rate limit exceeded (429)");
    let fallback = FakeAgent::ok("codex");
    let harness = Harness::new(
        repo.path(),
        test_config(),
        vec![primary.clone(), fallback.clone()],
        None,
    );
    let request = harness.claim("Fallback please");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert!(result.fallback_used);
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    // Without a tracker the pr phase is skipped but the card still moves on.
    assert!(result.pr_url.is_none());
    assert_eq!(harness.card(card_id).status, CardStatus::InReview);

    let job = harness.db.lock_sync().unwrap().get_job(job_id).unwrap().unwrap();
    let payload = job.result.expect("job result");
    assert_eq!(payload["fallback_used"], true);
    assert_eq!(payload["ai"]["tool"], "codex");
    assert_eq!(payload["ai"]["usage"]["input_tokens"], 120);
}

#[tokio::test]
async fn non_limit_failure_does_not_fall_back() {
    let (repo, _origin) = repo_with_origin();
    let primary = FakeAgent::failing("claude", "segmentation fault");
    let fallback = FakeAgent::ok("codex");
    let harness = Harness::new(
        repo.path(),
        test_config(),
        vec![primary.clone(), fallback.clone()],
        None,
    );
    let request = harness.claim("Broken tool");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let result = harness.run(request).await;

    assert!(!result.success);
    assert!(!result.canceled);
    assert_eq!(result.phase, "ai");
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);

    let card = harness.card(card_id);
    assert_eq!(card.status, CardStatus::Ready);
    assert!(card.last_failed_at.is_some());
    let job = harness.db.lock_sync().unwrap().get_job(job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap_or_default().starts_with("ai failed"));
}

#[tokio::test]
async fn card_pulled_back_during_checks_cancels_before_push() {
    let (repo, origin) = repo_with_origin();
    let mut config = test_config();
    config.checks.test = Some("sleep 2".to_string());
    let harness = Harness::new(repo.path(), config, vec![FakeAgent::ok("claude")], None);
    let request = harness.claim("Pulled back");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let mover = on_phase(&harness.db, job_id, "checks", move |db| {
        db.update_card_status(card_id, CardStatus::Draft).map(|_| ())
    });
    let result = harness.run(request).await;
    assert!(mover.await.unwrap().is_some(), "run never reached checks");

    assert!(result.canceled, "logs: {:?}", result.logs);
    assert!(!result.success);
    assert_eq!(result.visited.last(), Some(&Phase::Checks));
    assert!(!result.visited.contains(&Phase::Push));

    // The card keeps the status it was moved to; nothing was pushed.
    assert_eq!(harness.card(card_id).status, CardStatus::Draft);
    let branches = git(origin.path(), &["branch", "--list"]);
    assert!(!branches.contains("foundry/"), "branches: {}", branches);

    let db = harness.db.lock_sync().unwrap();
    assert_eq!(db.get_job(job_id).unwrap().unwrap().state, JobState::Canceled);
    let slot = db.get_slot(harness.project.id, 1).unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Idle);

    // Canceled runs follow the failure cleanup timing, which defaults to delay.
    let worktree = db.get_worktree_for_card(card_id).unwrap().expect("worktree row");
    assert_eq!(worktree.status, WorktreeStatus::CleanupPending);
    assert!(worktree.lock_holder.is_none());
    assert!(Path::new(&worktree.path).exists());
}

#[tokio::test]
async fn token_cancel_before_start_leaves_card_ready() {
    let (repo, _origin) = repo_with_origin();
    let agent = FakeAgent::ok("claude");
    let harness = Harness::new(repo.path(), test_config(), vec![agent.clone()], None);
    let request = harness.claim("Never started");
    let card_id = request.card.id;

    let token = CancellationToken::new();
    token.cancel();
    let result = harness.pipeline.run(request, token).await;

    assert!(result.canceled);
    assert_eq!(result.visited, vec![Phase::Init]);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.card(card_id).status, CardStatus::Ready);
}

#[tokio::test]
async fn persisted_cancel_stops_a_running_check() {
    let (repo, origin) = repo_with_origin();
    let mut config = test_config();
    config.checks.test = Some("sleep 30".to_string());
    let harness = Harness::new(repo.path(), config, vec![FakeAgent::ok("claude")], None);
    let request = harness.claim("Canceled by operator");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let canceler = on_phase(&harness.db, job_id, "checks", move |db| {
        db.cancel_job(job_id, "canceled from CLI").map(|_| ())
    });
    let result = harness.run(request).await;
    let finished = Instant::now();
    let canceled_at = canceler.await.unwrap().expect("run never reached checks");

    assert!(result.canceled, "logs: {:?}", result.logs);
    assert_eq!(result.visited.last(), Some(&Phase::Checks));
    // One probe interval plus the kill grace, with room for a slow machine.
    assert!(finished - canceled_at < Duration::from_secs(4));

    assert_eq!(harness.job(job_id).state, JobState::Canceled);
    assert_eq!(harness.card(card_id).status, CardStatus::Ready);
    let branches = git(origin.path(), &["branch", "--list"]);
    assert!(!branches.contains("foundry/"), "branches: {}", branches);
}

#[tokio::test]
async fn failing_checks_open_a_draft_pull_request() {
    let (repo, _origin) = repo_with_origin();
    let mut config = test_config();
    config.checks.test = Some("echo 'assertion failed' >&2; exit 1".to_string());
    let tracker = Arc::new(FakeTracker::default());
    let harness = Harness::new(
        repo.path(),
        config,
        vec![FakeAgent::ok("claude")],
        Some(tracker.clone()),
    );
    let request = harness.claim("Half done");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert_eq!(harness.card(card_id).status, CardStatus::InReview);
    let created = tracker.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert!(created[0].draft);
    assert_eq!(created[0].title, "[WIP] Half done");
    assert!(created[0].body.contains("Failing checks: test"));

    let payload = harness.job(job_id).result.expect("job result");
    assert_eq!(payload["draft"], true);
    assert_eq!(payload["failed_checks"][0], "test");
}

#[tokio::test]
async fn existing_pull_request_is_reused() {
    let (repo, origin) = repo_with_origin();
    let tracker = Arc::new(FakeTracker {
        existing: Some("https://example.test/pull/7"),
        ..Default::default()
    });
    let harness = Harness::new(
        repo.path(),
        test_config(),
        vec![FakeAgent::ok("claude")],
        Some(tracker.clone()),
    );
    let request = harness.claim("Second attempt");
    let card_id = request.card.id;

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert_eq!(result.pr_url.as_deref(), Some("https://example.test/pull/7"));
    assert!(tracker.created.lock().unwrap().is_empty());
    assert_eq!(harness.card(card_id).status, CardStatus::InReview);
    // The branch is still pushed so the existing pull request picks it up.
    let branches = git(origin.path(), &["branch", "--list"]);
    assert!(branches.contains(&format!("foundry/card-{}-", card_id)), "branches: {}", branches);
}

#[tokio::test]
async fn iterative_mode_commits_each_iteration() {
    let (repo, origin) = repo_with_origin();
    let mut config = test_config();
    config.iterative.enabled = true;
    config.iterative.max_iterations = 3;
    let agent = FakeAgent::ok("claude");
    let harness = Harness::new(repo.path(), config, vec![agent.clone()], None);
    let request = harness.claim("Step by step");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    let payload = harness.job(job_id).result.expect("job result");
    assert_eq!(payload["ai"]["iterations"], 3);
    assert_eq!(payload["ai"]["usage"]["input_tokens"], 360);

    let branch = payload["branch"].as_str().unwrap().to_string();
    assert!(branch.starts_with(&format!("foundry/card-{}-", card_id)));
    let log = git(origin.path(), &["log", "--format=%s", branch.as_str()]);
    for i in 1..=3 {
        assert!(log.contains(&format!("wip: iteration {} (card #{})", i, card_id)), "log: {}", log);
    }
}

#[tokio::test]
async fn decomposed_card_stops_once_subtasks_complete() {
    let (repo, _origin) = repo_with_origin();
    let mut config = test_config();
    config.decomposition.enabled = true;
    config.iterative.enabled = true;
    config.iterative.max_iterations = 5;
    let agent = Arc::new(SubtaskAgent::default());
    let harness = Harness::new(repo.path(), config, vec![agent.clone()], None);
    let request = harness.claim("Add an endpoint");
    let card_id = request.card.id;

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert!(result.visited.contains(&Phase::Decomposition));
    assert_eq!(agent.decomposition_calls.load(Ordering::SeqCst), 1);
    // Two subtasks, one per iteration, then the loop ends early.
    assert_eq!(agent.implementation_calls.load(Ordering::SeqCst), 2);

    let subtasks = harness.db.lock_sync().unwrap().list_subtasks(card_id).unwrap();
    let titles: Vec<_> = subtasks.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, ["Schema", "Endpoint"]);
    assert!(subtasks.iter().all(|s| s.status == SubtaskStatus::Completed));
}

#[tokio::test]
async fn limit_words_in_output_do_not_trigger_fallback() {
    let (repo, _origin) = repo_with_origin();
    let primary = FakeAgent::failing_with_output(
        "claude",
        "claude exited with code 1\npanic: index out of range",
        "fetching docs... HTTP 429, quota exceeded on the mirror",
    );
    let fallback = FakeAgent::ok("codex");
    let harness = Harness::new(
        repo.path(),
        test_config(),
        vec![primary.clone(), fallback.clone()],
        None,
    );
    let request = harness.claim("Chatty failure");

    let result = harness.run(request).await;

    assert!(!result.success);
    assert!(!result.fallback_used);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fallback_keeps_usage_from_earlier_iterations() {
    let (repo, _origin) = repo_with_origin();
    let mut config = test_config();
    config.iterative.enabled = true;
    config.iterative.max_iterations = 3;
    let primary = FakeAgent::failing_after("claude", 1, "usage limit reached, try again later");
    let fallback = FakeAgent::ok("codex");
    let harness = Harness::new(
        repo.path(),
        config,
        vec![primary.clone(), fallback.clone()],
        None,
    );
    let request = harness.claim("Long haul");
    let job_id = request.job_id;

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert!(result.fallback_used);
    assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);
    let payload = harness.job(job_id).result.expect("job result");
    assert_eq!(payload["ai"]["tool"], "codex");
    assert_eq!(payload["ai"]["iterations"], 3);
    // One primary iteration plus two on the fallback.
    assert_eq!(payload["ai"]["usage"]["input_tokens"], 360);
}

// =============================================================================
// Shared checkout
// =============================================================================

#[tokio::test]
async fn shared_checkout_restores_user_changes() {
    let (repo, origin) = dirty_repo_with_origin();
    let tracker = Arc::new(FakeTracker::default());
    let harness = Harness::new(
        repo.path(),
        shared_config(),
        vec![FakeAgent::ok("claude")],
        Some(tracker.clone()),
    );
    let request = harness.claim("Shared run");
    let card_id = request.card.id;

    let result = harness.run(request).await;

    assert!(result.success, "run failed: {:?}", result.logs);
    assert_eq!(harness.card(card_id).status, CardStatus::InReview);
    assert!(harness.db.lock_sync().unwrap().get_worktree_for_card(card_id).unwrap().is_none());

    // The work went out on its own branch.
    let head = tracker.created.lock().unwrap()[0].head.clone();
    let files = git(origin.path(), &["ls-tree", "--name-only", head.as_str()]);
    assert!(files.lines().any(|f| f == "claude.txt"), "files: {}", files);

    // The checkout is back where the user left it.
    assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    let readme = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
    assert_eq!(readme, "user edit\n");
    assert!(!repo.path().join("claude.txt").exists());
    assert!(git(repo.path(), &["stash", "list"]).is_empty());

    let lock = harness.sync_lock.snapshot();
    assert_eq!(lock.workers, 0);
    assert!(harness.sync_lock.try_acquire_sync().is_some());
}

#[tokio::test]
async fn shared_checkout_rolls_back_on_cancel() {
    let (repo, origin) = dirty_repo_with_origin();
    let mut config = shared_config();
    config.worktrees.rollback_on_cancel = true;
    config.checks.test = Some("sleep 2".to_string());
    let harness = Harness::new(repo.path(), config, vec![FakeAgent::ok("claude")], None);
    let request = harness.claim("Rolled back");
    let (card_id, job_id) = (request.card.id, request.job_id);

    let mover = on_phase(&harness.db, job_id, "checks", move |db| {
        db.update_card_status(card_id, CardStatus::Draft).map(|_| ())
    });
    let result = harness.run(request).await;
    assert!(mover.await.unwrap().is_some(), "run never reached checks");

    assert!(result.canceled, "logs: {:?}", result.logs);
    assert!(result.logs.iter().any(|l| l == "rolled back working tree"), "logs: {:?}", result.logs);
    assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    let readme = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
    assert_eq!(readme, "user edit\n");
    assert!(!repo.path().join("claude.txt").exists());
    assert!(git(repo.path(), &["stash", "list"]).is_empty());
    let branches = git(origin.path(), &["branch", "--list"]);
    assert!(!branches.contains("foundry/"), "branches: {}", branches);
    assert_eq!(harness.sync_lock.snapshot().workers, 0);
}
