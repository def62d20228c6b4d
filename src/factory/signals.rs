//! Signal tags emitted by agents in their output.
//!
//! - `<progress>X%</progress>` or `<progress>X</progress>`
//! - `<blocker>description</blocker>`
//! - `<subtask-complete>N</subtask-complete>` (1-based subtask position)
//! - `<summary>...</summary>` carried into the next iteration's prompt

use regex::Regex;
use std::sync::LazyLock;

static PROGRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<progress>\s*(\d{1,3})%?\s*</progress>").unwrap());

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<blocker>(.*?)</blocker>").unwrap());

static SUBTASK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<subtask-complete>\s*(\d+)\s*</subtask-complete>").unwrap());

static SUMMARY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<summary>\s*(.*?)\s*</summary>").unwrap());

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSignals {
    /// Last reported percentage, clamped to 100.
    pub progress: Option<u8>,
    pub blockers: Vec<String>,
    /// Distinct subtask positions in report order.
    pub completed_subtasks: Vec<i64>,
    /// Last `<summary>` block, if any.
    pub summary: Option<String>,
}

pub fn extract_signals(text: &str) -> AgentSignals {
    let mut signals = AgentSignals::default();

    for cap in PROGRESS_REGEX.captures_iter(text) {
        if let Some(Ok(pct)) = cap.get(1).map(|m| m.as_str().parse::<u8>()) {
            signals.progress = Some(pct.min(100));
        }
    }

    for cap in BLOCKER_REGEX.captures_iter(text) {
        if let Some(desc) = cap.get(1).map(|m| m.as_str().trim())
            && !desc.is_empty()
        {
            signals.blockers.push(desc.to_string());
        }
    }

    for cap in SUBTASK_REGEX.captures_iter(text) {
        if let Some(Ok(n)) = cap.get(1).map(|m| m.as_str().parse::<i64>())
            && !signals.completed_subtasks.contains(&n)
        {
            signals.completed_subtasks.push(n);
        }
    }

    signals.summary = SUMMARY_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .filter(|s| !s.is_empty())
        .last();

    signals
}
