//! Prompt Builder - renders the prompt for each implementation iteration
//!
//! Every iteration is a fresh completion with no memory. The prompt carries:
//! - the task and its acceptance criteria
//! - the repository structure and key file contents
//! - summaries of previous iterations and their self-checks
//! - the latest human feedback, if any
//! - the exact JSON shape the response must take

use super::context_builder::RepositoryContext;
use crate::models::{Feedback, Iteration, Repository, Task};
use std::fmt::Write;

/// How many previous iterations are summarized in the prompt
const MAX_PREVIOUS_ITERATIONS: usize = 5;

/// Fixed system prompt for every implementation call
pub const SYSTEM_PROMPT: &str = r#"You are an autonomous software engineer working on a single task in a git repository.
You cannot run code. You change the repository only by returning file changes in the JSON format you are given.
Each of your responses is applied as one commit on a dedicated branch, and you will be called again with the updated repository until every acceptance criterion passes.
Be honest in your self-check: mark a criterion as passed only when the repository, after your changes, satisfies it. Report a confidence between 0 and 1.
If the task is ambiguous or you need a decision only a human can make, set needsHumanInput to true and explain why instead of guessing."#;

/// Everything the iteration prompt is built from
pub struct PromptInput<'a> {
    pub task: &'a Task,
    pub repository: &'a Repository,
    pub branch: &'a str,
    pub criteria: &'a [String],
    pub iteration_number: u32,
    pub max_iterations: u32,
    pub context: &'a RepositoryContext,
    pub previous_iterations: &'a [Iteration],
    pub human_feedback: Option<&'a Feedback>,
}

/// Build the user prompt for one iteration
pub fn build_iteration_prompt(input: &PromptInput<'_>) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "# Task Implementation - Iteration {} of {}\n",
        input.iteration_number, input.max_iterations
    );

    let _ = writeln!(prompt, "## Task\n");
    let _ = writeln!(prompt, "**{}**\n", input.task.title);
    if !input.task.description.trim().is_empty() {
        let _ = writeln!(prompt, "{}\n", input.task.description.trim());
    }

    let _ = writeln!(prompt, "## Acceptance Criteria\n");
    for (index, criterion) in input.criteria.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {}", index + 1, criterion);
    }
    prompt.push('\n');

    let _ = writeln!(prompt, "## Repository\n");
    let _ = writeln!(
        prompt,
        "- **Repository**: {}\n- **Branch**: {}\n",
        input.repository.full_name(),
        input.branch
    );

    render_structure(&mut prompt, input.context);
    render_key_files(&mut prompt, input.context);
    render_previous_iterations(&mut prompt, input.previous_iterations);

    if let Some(feedback) = input.human_feedback {
        let _ = writeln!(prompt, "## Human Feedback\n");
        let _ = writeln!(
            prompt,
            "A reviewer ({}) left this {} for you. It takes precedence over your own plan:\n",
            feedback.created_by,
            match feedback.feedback_type {
                crate::models::FeedbackType::Rejection => "rejection",
                _ => "guidance",
            }
        );
        let _ = writeln!(prompt, "> {}\n", feedback.content.trim().replace('\n', "\n> "));
    }

    prompt.push_str(RULES_AND_FORMAT);
    prompt
}

fn render_structure(prompt: &mut String, context: &RepositoryContext) {
    let _ = writeln!(prompt, "### File Structure\n");
    if context.file_paths.is_empty() {
        let _ = writeln!(prompt, "(the branch has no files yet)\n");
        return;
    }
    prompt.push_str("```\n");
    for path in &context.file_paths {
        let _ = writeln!(prompt, "{}", path);
    }
    if context.total_files > context.file_paths.len() {
        let _ = writeln!(
            prompt,
            "... and {} more files",
            context.total_files - context.file_paths.len()
        );
    }
    prompt.push_str("```\n\n");
}

fn render_key_files(prompt: &mut String, context: &RepositoryContext) {
    if context.key_files.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "### Key Files\n");
    for file in &context.key_files {
        let _ = writeln!(prompt, "#### {}\n", file.path);
        let _ = writeln!(prompt, "```\n{}\n```\n", file.content);
    }
}

fn render_previous_iterations(prompt: &mut String, iterations: &[Iteration]) {
    if iterations.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "## Previous Iterations\n");

    let skip = iterations.len().saturating_sub(MAX_PREVIOUS_ITERATIONS);
    if skip > 0 {
        let _ = writeln!(prompt, "({} earlier iterations omitted)\n", skip);
    }

    for iteration in iterations.iter().skip(skip) {
        let _ = writeln!(prompt, "### Iteration {}\n", iteration.iteration_number);
        if let Some(message) = &iteration.commit_message {
            let _ = writeln!(prompt, "- Commit: {}", message);
        }
        if !iteration.changes_made.is_empty() {
            let files: Vec<String> = iteration
                .changes_made
                .iter()
                .map(|c| format!("{} ({})", c.file, c.operation.as_str()))
                .collect();
            let _ = writeln!(prompt, "- Changed: {}", files.join(", "));
        }
        if let Some(verification) = &iteration.verification_results {
            let _ = writeln!(
                prompt,
                "- Self-check: {}/{} criteria passed, confidence {:.2}",
                iteration.criteria_passed, iteration.criteria_total, verification.confidence
            );
            for failed in verification.criteria.iter().filter(|c| !c.passed) {
                match &failed.notes {
                    Some(notes) => {
                        let _ = writeln!(prompt, "  - NOT passed: {} ({})", failed.criterion, notes);
                    }
                    None => {
                        let _ = writeln!(prompt, "  - NOT passed: {}", failed.criterion);
                    }
                }
            }
        }
        if let Some(reason) = &iteration.blocked_reason {
            let _ = writeln!(prompt, "- Blocked: {}", reason);
        }
        prompt.push('\n');
    }
}

const RULES_AND_FORMAT: &str = r#"## IMPORTANT RULES (You MUST follow these)

1. **Work only on this task** - Do not refactor or change unrelated code
2. **Return complete file contents** - For create and update, `content` is the full new file, not a diff
3. **Build on previous iterations** - Their changes are already committed on the branch
4. **Be honest in the self-check** - `allPassed` is true only if every criterion passes
5. **Ask instead of guessing** - Use `needsHumanInput` when a human decision is required

## Response Format

Respond with a single JSON object inside a ```json code block and nothing else:

```json
{
  "needsHumanInput": false,
  "humanInputReason": null,
  "changes": [
    {
      "path": "relative/path/to/file",
      "operation": "create | update | delete | rename",
      "content": "full file content (create/update/rename)",
      "previousPath": "old/path (rename only)",
      "summary": "one line describing the change"
    }
  ],
  "commitMessage": "short imperative commit message",
  "selfCheck": {
    "criteria": [
      { "criterion": "text of the criterion", "passed": true, "notes": "evidence or what is missing" }
    ],
    "allPassed": true,
    "confidence": 0.9
  }
}
```
"#;
