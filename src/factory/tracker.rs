//! Remote tracker adapters.
//!
//! `RemoteTracker` is the capability interface the pipeline and sync
//! scheduler talk to. Concrete providers shell out to the forge's own CLI
//! (`gh` for GitHub, `glab` for GitLab), which owns authentication. The
//! provider is chosen from configuration in `build_tracker`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

use super::models::CardStatus;
use crate::config::{FoundryToml, TrackerProvider};

const CLI_TIMEOUT: Duration = Duration::from_secs(60);
const ISSUE_LIST_LIMIT: &str = "200";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteIssue {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: i64,
    pub url: String,
    pub head: String,
    pub draft: bool,
}

#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

#[async_trait]
pub trait RemoteTracker: Send + Sync {
    fn provider(&self) -> &str;

    /// Prefix applied to status labels, e.g. `foundry:`.
    fn label_prefix(&self) -> &str;

    async fn check_auth(&self) -> Result<bool>;

    async fn list_issues(&self) -> Result<Vec<RemoteIssue>>;

    /// Open pull/merge requests whose source branch is `head`.
    async fn list_pull_requests(&self, head: &str) -> Result<Vec<PullRequest>>;

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest>;

    async fn update_labels(&self, issue: i64, add: &[String], remove: &[String]) -> Result<()>;

    async fn comment_on_issue(&self, issue: i64, body: &str) -> Result<()>;

    /// Returns the new issue's number.
    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<i64>;

    fn status_label(&self, status: CardStatus) -> String {
        format!("{}{}", self.label_prefix(), status.as_str())
    }

    fn status_labels(&self) -> Vec<String> {
        CardStatus::ALL.iter().map(|s| self.status_label(*s)).collect()
    }
}

/// Replace whatever status label an issue carries with the one for `status`.
pub async fn mirror_status(tracker: &dyn RemoteTracker, issue: i64, status: CardStatus) -> Result<()> {
    let add = tracker.status_label(status);
    let remove: Vec<String> = tracker
        .status_labels()
        .into_iter()
        .filter(|l| *l != add)
        .collect();
    tracker.update_labels(issue, &[add], &remove).await
}

/// Select the tracker adapter from configuration.
pub fn build_tracker(config: &FoundryToml, repo_root: &Path) -> Option<Arc<dyn RemoteTracker>> {
    let repo = config.tracker.repo.clone();
    let prefix = config.tracker.label_prefix.clone();
    match config.tracker.provider {
        TrackerProvider::None => None,
        TrackerProvider::Github => Some(Arc::new(GitHubTracker::new(repo_root, repo, prefix))),
        TrackerProvider::Gitlab => Some(Arc::new(GitLabTracker::new(repo_root, repo, prefix))),
    }
}

async fn run_cli(program: &str, args: &[String], cwd: &Path) -> Result<String> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    let output = tokio::time::timeout(CLI_TIMEOUT, child.wait_with_output())
        .await
        .with_context(|| format!("{} {} timed out", program, args.first().map(String::as_str).unwrap_or("")))?
        .with_context(|| format!("Failed to wait for {}", program))?;

    if !output.status.success() {
        bail!(
            "{} {} failed (exit {}): {}",
            program,
            args.iter().take(2).cloned().collect::<Vec<_>>().join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Trailing number of an issue or PR URL (`.../pull/42`, `.../-/merge_requests/7`).
pub fn parse_number_from_url(text: &str) -> Option<i64> {
    let url = text
        .split_whitespace()
        .filter(|w| w.starts_with("http"))
        .last()?;
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

fn last_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .filter(|w| w.starts_with("http"))
        .last()
        .map(str::to_string)
}

// -- GitHub ---------------------------------------------------------------

pub struct GitHubTracker {
    cwd: PathBuf,
    repo: Option<String>,
    label_prefix: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: i64,
    url: String,
    head_ref_name: String,
    #[serde(default)]
    is_draft: bool,
}

pub fn parse_gh_issues(json: &str) -> Result<Vec<RemoteIssue>> {
    let issues: Vec<GhIssue> = serde_json::from_str(json).context("Failed to parse gh issue list")?;
    Ok(issues
        .into_iter()
        .map(|i| RemoteIssue {
            number: i.number,
            title: i.title,
            body: i.body.unwrap_or_default(),
            state: if i.state.eq_ignore_ascii_case("open") {
                IssueState::Open
            } else {
                IssueState::Closed
            },
            labels: i.labels.into_iter().map(|l| l.name).collect(),
        })
        .collect())
}

pub fn parse_gh_pull_requests(json: &str) -> Result<Vec<PullRequest>> {
    let prs: Vec<GhPullRequest> = serde_json::from_str(json).context("Failed to parse gh pr list")?;
    Ok(prs
        .into_iter()
        .map(|p| PullRequest {
            number: p.number,
            url: p.url,
            head: p.head_ref_name,
            draft: p.is_draft,
        })
        .collect())
}

impl GitHubTracker {
    pub fn new(cwd: &Path, repo: Option<String>, label_prefix: String) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            repo,
            label_prefix,
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let mut full = to_args(args);
        if let Some(repo) = &self.repo {
            full.push("--repo".into());
            full.push(repo.clone());
        }
        run_cli("gh", &full, &self.cwd).await
    }

    async fn ensure_label(&self, name: &str) -> Result<()> {
        self.gh(&["label", "create", name, "--force", "--color", "5319e7"])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl RemoteTracker for GitHubTracker {
    fn provider(&self) -> &str {
        "github"
    }

    fn label_prefix(&self) -> &str {
        &self.label_prefix
    }

    async fn check_auth(&self) -> Result<bool> {
        Ok(run_cli("gh", &to_args(&["auth", "status"]), &self.cwd).await.is_ok())
    }

    async fn list_issues(&self) -> Result<Vec<RemoteIssue>> {
        let out = self
            .gh(&[
                "issue", "list", "--state", "all", "--limit", ISSUE_LIST_LIMIT, "--json",
                "number,title,body,state,labels",
            ])
            .await?;
        parse_gh_issues(&out)
    }

    async fn list_pull_requests(&self, head: &str) -> Result<Vec<PullRequest>> {
        let out = self
            .gh(&[
                "pr", "list", "--head", head, "--state", "open", "--json",
                "number,url,headRefName,isDraft",
            ])
            .await?;
        parse_gh_pull_requests(&out)
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        let mut args = vec![
            "pr", "create", "--title", request.title.as_str(), "--body", request.body.as_str(), "--base",
            request.base.as_str(), "--head", request.head.as_str(),
        ];
        if request.draft {
            args.push("--draft");
        }
        let out = self.gh(&args).await?;
        let url = last_url(&out).with_context(|| format!("gh pr create printed no URL: {}", out))?;
        Ok(PullRequest {
            number: parse_number_from_url(&url).unwrap_or(0),
            url,
            head: request.head.clone(),
            draft: request.draft,
        })
    }

    async fn update_labels(&self, issue: i64, add: &[String], remove: &[String]) -> Result<()> {
        for label in add {
            self.ensure_label(label).await?;
        }
        let number = issue.to_string();
        let add = add.join(",");
        let remove = remove.join(",");
        let mut args = vec!["issue", "edit", number.as_str()];
        if !add.is_empty() {
            args.extend(["--add-label", add.as_str()]);
        }
        if !remove.is_empty() {
            args.extend(["--remove-label", remove.as_str()]);
        }
        self.gh(&args).await.map(|_| ())
    }

    async fn comment_on_issue(&self, issue: i64, body: &str) -> Result<()> {
        let number = issue.to_string();
        self.gh(&["issue", "comment", number.as_str(), "--body", body])
            .await
            .map(|_| ())
    }

    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<i64> {
        for label in labels {
            self.ensure_label(label).await?;
        }
        let joined = labels.join(",");
        let mut args = vec!["issue", "create", "--title", title, "--body", body];
        if !joined.is_empty() {
            args.extend(["--label", joined.as_str()]);
        }
        let out = self.gh(&args).await?;
        parse_number_from_url(&out).with_context(|| format!("gh issue create printed no URL: {}", out))
    }
}

// -- GitLab ---------------------------------------------------------------

pub struct GitLabTracker {
    cwd: PathBuf,
    repo: Option<String>,
    label_prefix: String,
}

#[derive(Debug, Deserialize)]
struct GlabIssue {
    iid: i64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GlabMergeRequest {
    iid: i64,
    web_url: String,
    source_branch: String,
    #[serde(default)]
    draft: bool,
}

pub fn parse_glab_issues(json: &str) -> Result<Vec<RemoteIssue>> {
    let issues: Vec<GlabIssue> =
        serde_json::from_str(json).context("Failed to parse glab issue list")?;
    Ok(issues
        .into_iter()
        .map(|i| RemoteIssue {
            number: i.iid,
            title: i.title,
            body: i.description.unwrap_or_default(),
            state: if i.state == "opened" {
                IssueState::Open
            } else {
                IssueState::Closed
            },
            labels: i.labels,
        })
        .collect())
}

pub fn parse_glab_merge_requests(json: &str) -> Result<Vec<PullRequest>> {
    let mrs: Vec<GlabMergeRequest> =
        serde_json::from_str(json).context("Failed to parse glab mr list")?;
    Ok(mrs
        .into_iter()
        .map(|m| PullRequest {
            number: m.iid,
            url: m.web_url,
            head: m.source_branch,
            draft: m.draft,
        })
        .collect())
}

impl GitLabTracker {
    pub fn new(cwd: &Path, repo: Option<String>, label_prefix: String) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            repo,
            label_prefix,
        }
    }

    async fn glab(&self, args: &[&str]) -> Result<String> {
        let mut full = to_args(args);
        if let Some(repo) = &self.repo {
            full.push("--repo".into());
            full.push(repo.clone());
        }
        run_cli("glab", &full, &self.cwd).await
    }
}

#[async_trait]
impl RemoteTracker for GitLabTracker {
    fn provider(&self) -> &str {
        "gitlab"
    }

    fn label_prefix(&self) -> &str {
        &self.label_prefix
    }

    async fn check_auth(&self) -> Result<bool> {
        Ok(run_cli("glab", &to_args(&["auth", "status"]), &self.cwd).await.is_ok())
    }

    async fn list_issues(&self) -> Result<Vec<RemoteIssue>> {
        let out = self
            .glab(&["issue", "list", "--all", "--per-page", ISSUE_LIST_LIMIT, "--output", "json"])
            .await?;
        parse_glab_issues(&out)
    }

    async fn list_pull_requests(&self, head: &str) -> Result<Vec<PullRequest>> {
        let out = self
            .glab(&["mr", "list", "--source-branch", head, "--output", "json"])
            .await?;
        parse_glab_merge_requests(&out)
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        let mut args = vec![
            "mr", "create", "--title", request.title.as_str(), "--description", request.body.as_str(),
            "--target-branch", request.base.as_str(), "--source-branch", request.head.as_str(), "--yes",
        ];
        if request.draft {
            args.push("--draft");
        }
        let out = self.glab(&args).await?;
        let url = last_url(&out).with_context(|| format!("glab mr create printed no URL: {}", out))?;
        Ok(PullRequest {
            number: parse_number_from_url(&url).unwrap_or(0),
            url,
            head: request.head.clone(),
            draft: request.draft,
        })
    }

    async fn update_labels(&self, issue: i64, add: &[String], remove: &[String]) -> Result<()> {
        let number = issue.to_string();
        let add = add.join(",");
        let remove = remove.join(",");
        let mut args = vec!["issue", "update", number.as_str()];
        if !add.is_empty() {
            args.extend(["--label", add.as_str()]);
        }
        if !remove.is_empty() {
            args.extend(["--unlabel", remove.as_str()]);
        }
        self.glab(&args).await.map(|_| ())
    }

    async fn comment_on_issue(&self, issue: i64, body: &str) -> Result<()> {
        let number = issue.to_string();
        self.glab(&["issue", "note", number.as_str(), "--message", body])
            .await
            .map(|_| ())
    }

    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<i64> {
        let joined = labels.join(",");
        let mut args = vec!["issue", "create", "--title", title, "--description", body, "--yes"];
        if !joined.is_empty() {
            args.extend(["--label", joined.as_str()]);
        }
        let out = self.glab(&args).await?;
        parse_number_from_url(&out)
            .with_context(|| format!("glab issue create printed no URL: {}", out))
    }
}
