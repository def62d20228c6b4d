use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::agent::{AgentRun, AgentTool};
use super::cancel::CancelSignal;
use super::git::git;
use super::models::Card;
use super::process::LineLogger;
use crate::util::{extract_json_object, tail_chars};

/// Files listed in the repository context.
const MAX_CONTEXT_FILES: usize = 200;
const MAX_README_CHARS: usize = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub summary: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl PlanResponse {
    pub fn parse(text: &str) -> Result<Self> {
        let json = extract_json_object(text).context("Planner response contains no JSON object")?;
        let plan: PlanResponse =
            serde_json::from_str(&json).context("Failed to parse planner response as JSON")?;
        anyhow::ensure!(!plan.steps.is_empty(), "Planner returned an empty plan");
        Ok(plan)
    }

    pub fn fallback(title: &str, description: &str) -> Self {
        PlanResponse {
            summary: "Fallback: implement the card as a single step".to_string(),
            steps: vec![PlanStep {
                title: title.to_string(),
                description: format!(
                    "Implement the following:\n\nTitle: {}\n\n{}",
                    title, description
                ),
                files: vec![],
            }],
        }
    }

    /// Markdown rendering for inclusion in the implementation prompt.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n", self.summary);
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("\n{}. {}", i + 1, step.title));
            if !step.description.is_empty() {
                out.push_str(&format!("\n   {}", step.description.replace('\n', "\n   ")));
            }
            if !step.files.is_empty() {
                out.push_str(&format!("\n   Files: {}", step.files.join(", ")));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionResponse {
    pub subtasks: Vec<SubtaskDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl DecompositionResponse {
    /// Parse and keep at most `max` non-blank subtasks.
    pub fn parse(text: &str, max: usize) -> Result<Self> {
        let json =
            extract_json_object(text).context("Decomposition response contains no JSON object")?;
        let mut parsed: DecompositionResponse =
            serde_json::from_str(&json).context("Failed to parse decomposition response")?;
        parsed.subtasks.retain(|s| !s.title.trim().is_empty());
        parsed.subtasks.truncate(max);
        Ok(parsed)
    }
}

const PLANNER_INSTRUCTIONS: &str = r#"You are a software engineering planner. Analyze the card below and produce an implementation plan.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "summary": "One-paragraph approach",
  "steps": [
    { "title": "Short step name", "description": "What to change and why", "files": ["path/to/file.rs"] }
  ]
}

Rules:
- For simple cards, return a single step; don't over-plan.
- Do not modify any files; only plan.
"#;

const DECOMPOSER_INSTRUCTIONS: &str = r#"You split a work item into independently verifiable subtasks.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{ "subtasks": [ { "title": "Short name", "description": "Done when ..." } ] }

Rules:
- Order subtasks so each builds on the previous ones.
- Return a single subtask if the work item is already small.
- Do not modify any files.
"#;

/// Outcome of an agent-backed planning step.
#[derive(Debug, Clone)]
pub enum Planned<T> {
    Ready(T),
    Canceled { reason: String },
}

pub struct Planner {
    tool: Arc<dyn AgentTool>,
    timeout: Duration,
}

impl Planner {
    pub fn new(tool: Arc<dyn AgentTool>, timeout: Duration) -> Self {
        Self { tool, timeout }
    }

    /// Ask the agent for a plan. Any failure other than cancellation yields
    /// the single-step fallback plan.
    pub async fn plan(
        &self,
        card: &Card,
        repo_context: &str,
        cwd: &Path,
        cancel: &CancelSignal,
        logger: &LineLogger,
    ) -> Planned<PlanResponse> {
        let prompt = format!(
            "{}\n## Card\n**Title:** {}\n**Description:** {}\n**Labels:** {}\n\n## Repository Context\n{}\n\nRespond with JSON only.",
            PLANNER_INSTRUCTIONS,
            card.title,
            card.description,
            card.labels.join(", "),
            repo_context,
        );
        match self.tool.execute(&prompt, cwd, self.timeout, cancel, logger).await {
            AgentRun::Canceled { reason } => Planned::Canceled { reason },
            AgentRun::Completed(resp) if resp.success => match PlanResponse::parse(&resp.output) {
                Ok(plan) => Planned::Ready(plan),
                Err(e) => {
                    tracing::warn!(
                        card_id = card.id,
                        error = %e,
                        raw = %tail_chars(&resp.output, 500),
                        "invalid plan, falling back to single-step plan"
                    );
                    Planned::Ready(PlanResponse::fallback(&card.title, &card.description))
                }
            },
            AgentRun::Completed(resp) => {
                tracing::warn!(
                    card_id = card.id,
                    tool = self.tool.name(),
                    error = resp.error.as_deref().unwrap_or("unknown"),
                    "planning call failed, falling back to single-step plan"
                );
                Planned::Ready(PlanResponse::fallback(&card.title, &card.description))
            }
        }
    }

    /// Ask the agent to split the card into at most `max` subtasks. Failure
    /// yields an empty list and the run proceeds undecomposed.
    pub async fn decompose(
        &self,
        card: &Card,
        repo_context: &str,
        max: usize,
        cwd: &Path,
        cancel: &CancelSignal,
        logger: &LineLogger,
    ) -> Planned<Vec<SubtaskDraft>> {
        let prompt = format!(
            "{}\nReturn at most {} subtasks.\n\n## Work item\n**Title:** {}\n**Description:** {}\n\n## Repository Context\n{}\n\nRespond with JSON only.",
            DECOMPOSER_INSTRUCTIONS, max, card.title, card.description, repo_context,
        );
        match self.tool.execute(&prompt, cwd, self.timeout, cancel, logger).await {
            AgentRun::Canceled { reason } => Planned::Canceled { reason },
            AgentRun::Completed(resp) if resp.success => {
                match DecompositionResponse::parse(&resp.output, max) {
                    Ok(parsed) => Planned::Ready(parsed.subtasks),
                    Err(e) => {
                        tracing::warn!(card_id = card.id, error = %e, "invalid decomposition, skipping");
                        Planned::Ready(Vec::new())
                    }
                }
            }
            AgentRun::Completed(resp) => {
                tracing::warn!(
                    card_id = card.id,
                    error = resp.error.as_deref().unwrap_or("unknown"),
                    "decomposition call failed, skipping"
                );
                Planned::Ready(Vec::new())
            }
        }
    }
}

/// Bounded repository overview for prompts: tracked files, README excerpt
/// and recent commits. Sections that cannot be read are omitted.
pub async fn gather_repo_context(cwd: &Path, timeout: Duration) -> String {
    let mut sections = Vec::new();

    match git(cwd, &["ls-files"], timeout).await {
        Ok(files) => {
            let all: Vec<&str> = files.lines().collect();
            let mut listing = all
                .iter()
                .take(MAX_CONTEXT_FILES)
                .copied()
                .collect::<Vec<_>>()
                .join("\n");
            if all.len() > MAX_CONTEXT_FILES {
                listing.push_str(&format!("\n... ({} more)", all.len() - MAX_CONTEXT_FILES));
            }
            sections.push(format!("### Files\n```\n{}\n```", listing));
        }
        Err(e) => tracing::debug!(error = %e, "git ls-files failed"),
    }

    for name in ["README.md", "README", "readme.md"] {
        if let Ok(text) = tokio::fs::read_to_string(cwd.join(name)).await {
            let excerpt: String = text.chars().take(MAX_README_CHARS).collect();
            sections.push(format!("### {}\n{}", name, excerpt));
            break;
        }
    }

    match git(cwd, &["log", "--oneline", "-10"], timeout).await {
        Ok(log) if !log.is_empty() => {
            sections.push(format!("### Recent Commits\n```\n{}\n```", log));
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "git log failed"),
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::agent::AgentResponse;
    use crate::factory::models::CardStatus;
    use crate::factory::process::tracing_logger;
    use async_trait::async_trait;

    struct Scripted(Option<&'static str>);

    #[async_trait]
    impl AgentTool for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn execute(
            &self,
            _prompt: &str,
            _cwd: &Path,
            _timeout: Duration,
            _cancel: &CancelSignal,
            _logger: &LineLogger,
        ) -> AgentRun {
            match self.0 {
                Some(out) => AgentRun::Completed(AgentResponse {
                    success: true,
                    output: out.to_string(),
                    ..Default::default()
                }),
                None => AgentRun::Completed(AgentResponse::failed("boom")),
            }
        }
    }

    fn card() -> Card {
        Card {
            id: 1,
            project_id: 1,
            title: "Add login".into(),
            description: "Email + password".into(),
            status: CardStatus::InProgress,
            labels: vec![],
            remote_issue_number: None,
            last_failed_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn parses_plan_wrapped_in_prose() {
        let plan = PlanResponse::parse(
            "Here you go:\n```json\n{\"summary\":\"s\",\"steps\":[{\"title\":\"a\",\"files\":[\"x.rs\"]}]}\n```",
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.render().contains("Files: x.rs"));
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert!(PlanResponse::parse(r#"{"summary":"s","steps":[]}"#).is_err());
        assert!(PlanResponse::parse("no json").is_err());
    }

    #[test]
    fn decomposition_is_truncated_and_blank_titles_dropped() {
        let parsed = DecompositionResponse::parse(
            r#"{"subtasks":[{"title":"a"},{"title":"  "},{"title":"b"},{"title":"c"}]}"#,
            2,
        )
        .unwrap();
        let titles: Vec<_> = parsed.subtasks.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_planning_falls_back() {
        let planner = Planner::new(Arc::new(Scripted(None)), Duration::from_secs(1));
        let out = planner
            .plan(&card(), "", Path::new("."), &CancelSignal::default(), &tracing_logger("t"))
            .await;
        match out {
            Planned::Ready(plan) => assert!(plan.steps[0].description.contains("Add login")),
            Planned::Canceled { .. } => panic!("unexpected cancel"),
        }
    }

    #[tokio::test]
    async fn invalid_decomposition_yields_no_subtasks() {
        let planner = Planner::new(Arc::new(Scripted(Some("not json"))), Duration::from_secs(1));
        let out = planner
            .decompose(&card(), "", 5, Path::new("."), &CancelSignal::default(), &tracing_logger("t"))
            .await;
        assert!(matches!(out, Planned::Ready(v) if v.is_empty()));
    }

    #[tokio::test]
    async fn repo_context_lists_files_and_readme() {
        let repo = crate::factory::testutil::init_repo();
        let ctx = gather_repo_context(repo.path(), Duration::from_secs(10)).await;
        assert!(ctx.contains("### Files"));
        assert!(ctx.contains("README.md"));
        assert!(ctx.contains("# demo"));
        assert!(ctx.contains("initial"));
    }
}
