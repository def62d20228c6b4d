//! Implementation prompt construction for the AI phase.

use super::models::{Card, Subtask, SubtaskStatus};

/// Everything that goes into one AI invocation's prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInput<'a> {
    pub card: Option<&'a Card>,
    pub plan: Option<String>,
    pub allowed_commands: &'a [String],
    pub allowed_paths: &'a [String],
    pub repo_context: &'a str,
    pub subtasks: &'a [Subtask],
    /// `(current, max)` in iterative mode, 1-based.
    pub iteration: Option<(u32, u32)>,
    /// Carried-over context from earlier iterations or a previous attempt.
    pub carryover: Option<&'a str>,
}

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let mut out = String::new();

    if let Some(card) = input.card {
        out.push_str(&format!("# Task: {}\n\n", card.title));
        if !card.description.trim().is_empty() {
            out.push_str(&format!("{}\n\n", card.description.trim()));
        }
    }

    if let Some(plan) = &input.plan {
        out.push_str("## Plan\n");
        out.push_str(plan.trim());
        out.push_str("\n\n");
    }

    if !input.subtasks.is_empty() {
        out.push_str("## Subtasks\n");
        for subtask in input.subtasks {
            let mark = match subtask.status {
                SubtaskStatus::Completed => "x",
                SubtaskStatus::Pending => " ",
            };
            out.push_str(&format!("- [{}] {}. {}", mark, subtask.position, subtask.title));
            if !subtask.description.is_empty() {
                out.push_str(&format!(": {}", subtask.description));
            }
            out.push('\n');
        }
        out.push_str(
            "\nWhen you finish a subtask, print <subtask-complete>N</subtask-complete> with its number.\n\n",
        );
    }

    if let Some((current, max)) = input.iteration {
        out.push_str(&format!("## Iteration {} of {}\n", current, max));
        out.push_str(
            "Continue from the current state of the working tree. End your answer with a \
             <summary>...</summary> block describing what is done and what remains.\n\n",
        );
    }

    if let Some(carry) = input.carryover.filter(|c| !c.trim().is_empty()) {
        out.push_str("## Progress So Far\n");
        out.push_str(carry.trim());
        out.push_str("\n\n");
    }

    if !input.allowed_commands.is_empty() || !input.allowed_paths.is_empty() {
        out.push_str("## Constraints\n");
        if !input.allowed_commands.is_empty() {
            out.push_str(&format!(
                "- Only run these commands: {}\n",
                input.allowed_commands.join(", ")
            ));
        }
        if !input.allowed_paths.is_empty() {
            out.push_str(&format!(
                "- Only modify files under: {}\n",
                input.allowed_paths.join(", ")
            ));
        }
        out.push('\n');
    }

    if !input.repo_context.trim().is_empty() {
        out.push_str("## Repository Context\n");
        out.push_str(input.repo_context.trim());
        out.push_str("\n\n");
    }

    out.push_str(
        "Make the changes directly in the working tree. Do not commit or push; \
         that is handled for you. Report blockers with <blocker>...</blocker>.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::models::CardStatus;

    fn card() -> Card {
        Card {
            id: 4,
            project_id: 1,
            title: "Add dark mode".into(),
            description: "Toggle in settings".into(),
            status: CardStatus::InProgress,
            labels: vec![],
            remote_issue_number: None,
            last_failed_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn subtask(position: i64, status: SubtaskStatus) -> Subtask {
        Subtask {
            id: position,
            card_id: 4,
            position,
            title: format!("step {}", position),
            description: String::new(),
            status,
            remote_issue_number: None,
        }
    }

    #[test]
    fn minimal_prompt_has_title_and_instructions() {
        let card = card();
        let prompt = build_prompt(&PromptInput {
            card: Some(&card),
            ..Default::default()
        });
        assert!(prompt.starts_with("# Task: Add dark mode"));
        assert!(prompt.contains("Toggle in settings"));
        assert!(!prompt.contains("## Subtasks"));
        assert!(!prompt.contains("## Constraints"));
    }

    #[test]
    fn full_prompt_includes_every_section() {
        let card = card();
        let commands = vec!["cargo test".to_string()];
        let paths = vec!["src/".to_string()];
        let subtasks = vec![
            subtask(1, SubtaskStatus::Completed),
            subtask(2, SubtaskStatus::Pending),
        ];
        let prompt = build_prompt(&PromptInput {
            card: Some(&card),
            plan: Some("1. do it".into()),
            allowed_commands: &commands,
            allowed_paths: &paths,
            repo_context: "### Files\nsrc/main.rs",
            subtasks: &subtasks,
            iteration: Some((2, 5)),
            carryover: Some("theme struct added"),
        });
        assert!(prompt.contains("## Plan\n1. do it"));
        assert!(prompt.contains("- [x] 1. step 1"));
        assert!(prompt.contains("- [ ] 2. step 2"));
        assert!(prompt.contains("<subtask-complete>N</subtask-complete>"));
        assert!(prompt.contains("Iteration 2 of 5"));
        assert!(prompt.contains("theme struct added"));
        assert!(prompt.contains("cargo test"));
        assert!(prompt.contains("src/main.rs"));
    }
}
