//! AI coding-tool adapters.
//!
//! `AgentTool` is the capability seam: the pipeline never inspects which
//! concrete CLI it is driving. `select_tools` turns the configured
//! preference into a primary tool plus an optional fallback used when the
//! primary reports a rate-limit-class failure.

use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::cancel::CancelSignal;
use super::process::{LineLogger, ProcessOutcome, ProcessSpec, run_streaming};
use crate::config::{FoundryToml, ToolPreference};
use crate::errors::{PipelineError, ProcessError};
use crate::util::extract_json_object;

static LIMIT_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(rate[ _-]?limit|\b429\b|quota|usage limit|too many requests|overloaded|capacity exceeded)",
    )
    .unwrap()
});

static CODEX_TOKENS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)tokens used:?\s*([\d,]+)").unwrap());

/// Whether an error message describes a provider rate or quota limit.
pub fn is_rate_limit_message(message: &str) -> bool {
    LIMIT_ERROR_REGEX.is_match(message)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub success: bool,
    pub output: String,
    pub usage: Usage,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl AgentResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum AgentRun {
    Completed(AgentResponse),
    Canceled { reason: String },
}

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the tool's executable can be found.
    fn is_available(&self) -> bool;

    /// Run one prompt in `cwd`. Failures are reported in the response, not
    /// as `Err`; only cancellation is a distinct outcome.
    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
        logger: &LineLogger,
    ) -> AgentRun;

    fn is_retryable_limit_error(&self, error: &str) -> bool {
        is_rate_limit_message(error)
    }
}

fn on_path(command: &str) -> bool {
    which::which(command).is_ok()
}

/// Fold a process result into an agent response using `parse` for success output.
fn fold_outcome(
    tool: &str,
    result: Result<ProcessOutcome, ProcessError>,
    parse: impl FnOnce(&str) -> AgentResponse,
) -> AgentRun {
    match result {
        Ok(ProcessOutcome::Canceled { reason }) => AgentRun::Canceled { reason },
        Ok(ProcessOutcome::Exited(out)) => AgentRun::Completed(parse(&out.stdout)),
        Err(e) => {
            let timed_out = e.is_timeout();
            let mut message = e.failure_summary().trim_end().to_string();
            if message.is_empty() {
                message = format!("{} failed", tool);
            }
            AgentRun::Completed(AgentResponse {
                success: false,
                output: e.tails(),
                usage: Usage::default(),
                error: Some(message),
                timed_out,
            })
        }
    }
}

/// The `claude` CLI in print mode with JSON output.
pub struct ClaudeCli {
    command: String,
    skip_permissions: bool,
}

impl ClaudeCli {
    pub fn new(command: impl Into<String>, skip_permissions: bool) -> Self {
        Self {
            command: command.into(),
            skip_permissions,
        }
    }

    fn args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("-p".to_string());
        args.push(prompt.to_string());
        args
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeResult {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Parse `claude --output-format json` stdout. Non-JSON output is kept as
/// plain text with unknown usage.
pub fn parse_claude_output(stdout: &str) -> AgentResponse {
    let parsed = serde_json::from_str::<ClaudeResult>(stdout.trim()).ok().or_else(|| {
        extract_json_object(stdout).and_then(|json| serde_json::from_str(&json).ok())
    });
    match parsed {
        Some(result) => {
            let usage = result
                .usage
                .map(|u| Usage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                    cost_usd: result.total_cost_usd,
                })
                .unwrap_or(Usage {
                    cost_usd: result.total_cost_usd,
                    ..Default::default()
                });
            AgentResponse {
                success: !result.is_error,
                error: result.is_error.then(|| result.result.clone()),
                output: result.result,
                usage,
                timed_out: false,
            }
        }
        None => AgentResponse {
            success: true,
            output: stdout.to_string(),
            ..Default::default()
        },
    }
}

#[async_trait]
impl AgentTool for ClaudeCli {
    fn name(&self) -> &str {
        "claude"
    }

    fn is_available(&self) -> bool {
        on_path(&self.command)
    }

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
        logger: &LineLogger,
    ) -> AgentRun {
        let spec = ProcessSpec::new(&self.command, cwd, timeout).args(self.args(prompt));
        let result = run_streaming(&spec, cancel, logger).await;
        fold_outcome(self.name(), result, parse_claude_output)
    }
}

/// The `codex` CLI in non-interactive exec mode.
pub struct CodexCli {
    command: String,
}

impl CodexCli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// Codex prints plain text and a `tokens used: N` footer.
pub fn parse_codex_output(stdout: &str) -> AgentResponse {
    let tokens = CODEX_TOKENS_REGEX
        .captures_iter(stdout)
        .last()
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse::<u64>().ok())
        .unwrap_or(0);
    AgentResponse {
        success: true,
        output: stdout.to_string(),
        usage: Usage {
            output_tokens: tokens,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[async_trait]
impl AgentTool for CodexCli {
    fn name(&self) -> &str {
        "codex"
    }

    fn is_available(&self) -> bool {
        on_path(&self.command)
    }

    async fn execute(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
        logger: &LineLogger,
    ) -> AgentRun {
        let spec = ProcessSpec::new(&self.command, cwd, timeout).args(["exec", "--full-auto", prompt]);
        let result = run_streaming(&spec, cancel, logger).await;
        fold_outcome(self.name(), result, parse_codex_output)
    }
}

/// The tools known to this build, in auto-selection order.
pub fn default_tools(config: &FoundryToml) -> Vec<Arc<dyn AgentTool>> {
    vec![
        Arc::new(ClaudeCli::new(config.claude_cmd(), config.agent.skip_permissions)),
        Arc::new(CodexCli::new(config.codex_cmd())),
    ]
}

#[derive(Clone)]
pub struct ToolSelection {
    pub primary: Arc<dyn AgentTool>,
    pub fallback: Option<Arc<dyn AgentTool>>,
}

/// Pick the primary tool for `preference` and the next available tool as
/// fallback. A named tool that is not installed is an error rather than a
/// silent switch.
pub fn select_tools(
    preference: ToolPreference,
    tools: &[Arc<dyn AgentTool>],
) -> Result<ToolSelection, PipelineError> {
    let available: Vec<&Arc<dyn AgentTool>> = tools.iter().filter(|t| t.is_available()).collect();
    let primary = match preference {
        ToolPreference::Auto => available.first().copied(),
        ToolPreference::Claude => available.iter().copied().find(|t| t.name() == "claude"),
        ToolPreference::Codex => available.iter().copied().find(|t| t.name() == "codex"),
    }
    .ok_or_else(|| PipelineError::NoToolAvailable {
        preference: preference.to_string(),
    })?;
    let fallback = available
        .iter()
        .copied()
        .find(|t| t.name() != primary.name())
        .cloned();
    Ok(ToolSelection {
        primary: primary.clone(),
        fallback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, bool);

    #[async_trait]
    impl AgentTool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn is_available(&self) -> bool {
            self.1
        }
        async fn execute(
            &self,
            _prompt: &str,
            _cwd: &Path,
            _timeout: Duration,
            _cancel: &CancelSignal,
            _logger: &LineLogger,
        ) -> AgentRun {
            AgentRun::Completed(AgentResponse::default())
        }
    }

    fn tools(claude: bool, codex: bool) -> Vec<Arc<dyn AgentTool>> {
        vec![Arc::new(Named("claude", claude)), Arc::new(Named("codex", codex))]
    }

    #[test]
    fn classifies_limit_errors() {
        for msg in [
            "Error: rate limit exceeded",
            "HTTP 429 Too Many Requests",
            "You have hit your usage limit",
            "API Error: Overloaded",
            "insufficient_quota",
            "rate_limit_error",
        ] {
            assert!(is_rate_limit_message(msg), "{msg}");
        }
        assert!(!is_rate_limit_message("syntax error near line 4294"));
        assert!(!is_rate_limit_message("permission denied"));
    }

    #[test]
    fn parses_claude_json() {
        let out = r#"{"type":"result","subtype":"success","is_error":false,"result":"Done. <subtask-complete>1</subtask-complete>","total_cost_usd":0.42,"usage":{"input_tokens":1200,"output_tokens":300}}"#;
        let resp = parse_claude_output(out);
        assert!(resp.success);
        assert!(resp.output.contains("subtask-complete"));
        assert_eq!(resp.usage.total_tokens(), 1500);
        assert!((resp.usage.cost_usd - 0.42).abs() < f64::EPSILON);
    }

    #[test]
    fn process_failure_is_classified_without_stdout() {
        let err = ProcessError::NonZeroExit {
            program: "claude".into(),
            exit_code: 1,
            stdout_tail: vec!["mirror answered 429, quota exceeded".into()],
            stderr_tail: vec!["panic: index out of range".into()],
        };
        let AgentRun::Completed(resp) = fold_outcome("claude", Err(err), parse_claude_output) else {
            panic!("expected a completed run");
        };
        assert!(!resp.success);
        assert!(resp.output.contains("429"));
        let error = resp.error.unwrap();
        assert!(error.contains("index out of range"));
        assert!(!is_rate_limit_message(&error));

        let limited = ProcessError::NonZeroExit {
            program: "claude".into(),
            exit_code: 1,
            stdout_tail: vec![],
            stderr_tail: vec!["Error: rate limit exceeded".into()],
        };
        let AgentRun::Completed(resp) = fold_outcome("claude", Err(limited), parse_claude_output) else {
            panic!("expected a completed run");
        };
        assert!(is_rate_limit_message(resp.error.as_deref().unwrap()));
    }

    #[test]
    fn claude_error_result_is_failure() {
        let resp = parse_claude_output(r#"{"is_error":true,"result":"Claude AI usage limit reached"}"#);
        assert!(!resp.success);
        assert!(is_rate_limit_message(resp.error.as_deref().unwrap()));
    }

    #[test]
    fn claude_plain_text_is_kept() {
        let resp = parse_claude_output("just text");
        assert!(resp.success);
        assert_eq!(resp.output, "just text");
        assert_eq!(resp.usage, Usage::default());
    }

    #[test]
    fn parses_codex_token_footer() {
        let resp = parse_codex_output("edited 3 files\ntokens used: 12,345\n");
        assert_eq!(resp.usage.total_tokens(), 12345);
    }

    #[test]
    fn auto_selects_first_available_with_fallback() {
        let sel = select_tools(ToolPreference::Auto, &tools(true, true)).unwrap();
        assert_eq!(sel.primary.name(), "claude");
        assert_eq!(sel.fallback.unwrap().name(), "codex");

        let sel = select_tools(ToolPreference::Auto, &tools(false, true)).unwrap();
        assert_eq!(sel.primary.name(), "codex");
        assert!(sel.fallback.is_none());
    }

    #[test]
    fn named_preference_must_be_installed() {
        let sel = select_tools(ToolPreference::Codex, &tools(true, true)).unwrap();
        assert_eq!(sel.primary.name(), "codex");
        assert_eq!(sel.fallback.unwrap().name(), "claude");

        let err = select_tools(ToolPreference::Claude, &tools(false, true)).err().unwrap();
        assert!(matches!(err, PipelineError::NoToolAvailable { .. }));
        assert!(select_tools(ToolPreference::Auto, &tools(false, false)).is_err());
    }

    #[tokio::test]
    async fn process_failure_becomes_failed_response() {
        let tool = ClaudeCli::new("definitely-not-claude-xyz", true);
        assert!(!tool.is_available());
        let run = tool
            .execute(
                "hi",
                &std::env::temp_dir(),
                Duration::from_secs(5),
                &CancelSignal::default(),
                &crate::factory::process::tracing_logger("test"),
            )
            .await;
        match run {
            AgentRun::Completed(resp) => {
                assert!(!resp.success);
                assert!(resp.error.is_some());
            }
            AgentRun::Canceled { .. } => panic!("not canceled"),
        }
    }
}
