// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Text the orchestrator sends to models and workers.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use crate::issues::Issue;
use crate::worker::{WorkerOutcome, BLOCKED_PREFIX, COMPLETION_SENTINEL, RESULT_MARKER};

const MANAGER_PROMPT: &str = r#"You are the manager of a team of autonomous coding agents working on one git repository.

You do not write code yourself. You plan work as issues, start worker agents on them, review what they produce and merge it.

## Workflow
1. Break requests into focused issues with create_issue. Name the files and directories each issue will touch.
2. Start work with spawn_worker. Each worker runs in its own git worktree on branch issue/<id>-<slug>. When all worker slots are busy, issues are queued by priority and start automatically.
3. When a worker finishes you receive a worker report. For completed work, use review_diff and run_tests, then merge_issue if it is good. For blocked or failed work, explain the problem to the user and suggest a way forward.
4. Use worker_status to check progress instead of guessing.

## Rules
- Avoid running two workers that touch the same directories at once. Conflict warnings are advisory; decide whether to wait.
- merge_issue, delete_issue, commit_files and run_tests may need user approval. If an action is cancelled, do not retry it unasked.
- Keep replies short. Report issue ids as #<id>."#;

/// System prompt for the manager model.
pub fn system_prompt(base_branch: &str, max_workers: usize, additions: Option<&str>) -> String {
    let mut prompt = String::from(MANAGER_PROMPT);
    let _ = write!(
        prompt,
        "\n\n## Environment\n- Base branch: {}\n- Worker slots: {}",
        base_branch, max_workers
    );
    if let Some(extra) = additions.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(extra.trim());
    }
    prompt
}

/// Task context piped to a worker's stdin.
///
/// `specs` pairs each declared spec path with its content when readable.
pub fn worker_context(issue: &Issue, worktree: &Path, branch: &str, specs: &[(String, Option<String>)]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Issue #{}: {}\n", issue.id, issue.title);
    let _ = writeln!(out, "Priority: {}", issue.priority);
    let _ = writeln!(out, "Branch: {}", branch);
    let _ = writeln!(out, "Working directory: {}\n", worktree.display());

    if !issue.description.trim().is_empty() {
        let _ = writeln!(out, "## Description\n\n{}\n", issue.description.trim());
    }

    if !issue.acceptance_criteria.is_empty() {
        out.push_str("## Acceptance criteria\n\n");
        for criterion in &issue.acceptance_criteria {
            let _ = writeln!(out, "- {}", criterion);
        }
        out.push('\n');
    }

    for (path, content) in specs {
        match content {
            Some(text) => {
                let _ = writeln!(out, "## Spec: {}\n\n{}\n", path, text.trim());
            }
            None => {
                let _ = writeln!(out, "## Spec: {}\n\n(not found in the repository)\n", path);
            }
        }
    }

    let _ = write!(
        out,
        "## Instructions\n\n\
         - Work only inside the working directory above and commit your changes on the branch.\n\
         - Do not merge into other branches.\n\
         - When the task is done, print the line `{sentinel}`.\n\
         - If you cannot continue, print `{blocked} <reason>` with a one-line reason and stop.\n\
         - Alternatively write the same line to `{marker}`.\n",
        sentinel = COMPLETION_SENTINEL,
        blocked = BLOCKED_PREFIX,
        marker = RESULT_MARKER,
    );
    out
}

/// Synthetic turn describing a finished worker.
pub fn worker_report(issue_id: u32, title: &str, outcome: &WorkerOutcome, elapsed: Duration, tail: &[String]) -> String {
    let mut out = format!(
        "[Worker report] The worker for issue #{} \"{}\" {} after {}.",
        issue_id,
        title,
        outcome.summary(),
        format_duration(elapsed)
    );

    if !tail.is_empty() {
        let _ = write!(out, "\n\nLast {} lines of output:\n```\n{}\n```", tail.len(), tail.join("\n"));
    }

    let next = match outcome {
        WorkerOutcome::Completed { confirmed: true } => {
            "The issue is now in review. Review the diff, run the tests and merge if it is good."
        }
        WorkerOutcome::Completed { confirmed: false } => {
            "The issue is now in review, but the worker exited without reporting completion. \
             Check the diff carefully before merging."
        }
        WorkerOutcome::Blocked { .. } => "The issue is blocked. Tell the user what is needed to unblock it.",
        WorkerOutcome::Failed { .. } => {
            "The issue is open again. Tell the user what went wrong and whether to retry."
        }
    };
    let _ = write!(out, "\n\n{}", next);
    out
}

/// Synthetic turn describing a queued issue whose worker could not be started.
pub fn launch_failure_report(issue_id: u32, error: &str) -> String {
    format!(
        "[Worker report] Issue #{} left the queue but its worker could not be started: {}\n\n\
         The issue was not started. Tell the user what went wrong and whether to retry.",
        issue_id, error
    )
}

/// `1h 02m`, `3m 07s` or `12s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::{IssueStatus, Priority};
    use chrono::Utc;

    fn issue() -> Issue {
        Issue {
            id: 4,
            title: "Add login".to_string(),
            slug: "add-login".to_string(),
            status: IssueStatus::Open,
            priority: Priority::High,
            specs: vec!["specs/auth.md".to_string()],
            description: "Build src/auth/login.rs".to_string(),
            acceptance_criteria: vec!["tests pass".to_string()],
            agent_log: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_worker_context_contents() {
        let context = worker_context(
            &issue(),
            Path::new("/repo/.conductor/worktrees/issue-4-add-login"),
            "issue/4-add-login",
            &[("specs/auth.md".to_string(), Some("Use sessions.".to_string()))],
        );
        assert!(context.starts_with("# Issue #4: Add login"));
        assert!(context.contains("- tests pass"));
        assert!(context.contains("## Spec: specs/auth.md\n\nUse sessions."));
        assert!(context.contains(COMPLETION_SENTINEL));
        assert!(context.contains(BLOCKED_PREFIX));
    }

    #[test]
    fn test_worker_report() {
        let report = worker_report(
            4,
            "Add login",
            &WorkerOutcome::Blocked {
                reason: "no schema".to_string(),
            },
            Duration::from_secs(75),
            &["a".to_string(), "b".to_string()],
        );
        assert!(report.contains("issue #4 \"Add login\" blocked: no schema after 1m 15s"));
        assert!(report.contains("Last 2 lines of output:\n```\na\nb\n```"));
        assert!(report.contains("blocked"));
    }

    #[test]
    fn test_launch_failure_report() {
        let report = launch_failure_report(9, "Failed to start the worker for issue #9: not found");
        assert!(report.starts_with("[Worker report] Issue #9"));
        assert!(report.contains("not found"));
        assert!(report.contains("was not started"));
    }

    #[test]
    fn test_system_prompt_additions() {
        let prompt = system_prompt("develop", 2, Some("Prefer small issues."));
        assert!(prompt.contains("Base branch: develop"));
        assert!(prompt.contains("Worker slots: 2"));
        assert!(prompt.ends_with("Prefer small issues."));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::from_secs(187)), "3m 07s");
        assert_eq!(format_duration(Duration::from_secs(3720)), "1h 02m");
    }
}
