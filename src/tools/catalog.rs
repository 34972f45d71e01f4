// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool definitions sent to the model with every manager request.

use serde_json::json;

use crate::types::{InputSchema, ToolDefinition};

fn issue_id(description: &str) -> serde_json::Value {
    json!({"type": "integer", "minimum": 1, "description": description})
}

fn priority() -> serde_json::Value {
    json!({"type": "string", "enum": ["high", "medium", "low"]})
}

/// The full manager tool catalog.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "create_issue",
            "Create a new issue. Returns its id. Reference files and directories the work will touch \
             so concurrent workers can be checked for conflicts.",
        )
        .with_schema(
            InputSchema::new()
                .with_property("title", json!({"type": "string"}))
                .with_property("description", json!({"type": "string"}))
                .with_property("priority", priority())
                .with_property(
                    "specs",
                    json!({"type": "array", "items": {"type": "string"}, "description": "Spec file paths"}),
                )
                .with_property(
                    "acceptance_criteria",
                    json!({"type": "array", "items": {"type": "string"}}),
                )
                .with_required(&["title", "description"]),
        ),
        ToolDefinition::new("list_issues", "List issues, optionally filtered by status.").with_schema(
            InputSchema::new().with_property(
                "status",
                json!({"type": "string", "enum": ["open", "in_progress", "review", "blocked", "done"]}),
            ),
        ),
        ToolDefinition::new(
            "spawn_worker",
            "Start a worker agent on an open issue in its own worktree. Queued by priority when all \
             worker slots are busy.",
        )
        .with_schema(
            InputSchema::new()
                .with_property("issue_id", issue_id("Issue to work on"))
                .with_required(&["issue_id"]),
        ),
        ToolDefinition::new(
            "review_diff",
            "Show the changes made in an issue's worktree relative to the base branch.",
        )
        .with_schema(
            InputSchema::new()
                .with_property("issue_id", issue_id("Issue to review"))
                .with_required(&["issue_id"]),
        ),
        ToolDefinition::new(
            "merge_issue",
            "Merge a reviewed issue branch into the base branch, mark it done and remove its worktree.",
        )
        .with_schema(
            InputSchema::new()
                .with_property("issue_id", issue_id("Issue to merge"))
                .with_required(&["issue_id"]),
        ),
        ToolDefinition::new(
            "run_tests",
            "Run the configured test command in an issue's worktree, or in the repository root.",
        )
        .with_schema(InputSchema::new().with_property("issue_id", issue_id("Worktree to test in"))),
        ToolDefinition::new("create_spec", "Write a markdown spec document.").with_schema(
            InputSchema::new()
                .with_property(
                    "name",
                    json!({"type": "string", "description": "File name without extension"}),
                )
                .with_property("content", json!({"type": "string"}))
                .with_required(&["name", "content"]),
        ),
        ToolDefinition::new("list_specs", "List spec documents."),
        ToolDefinition::new(
            "worker_status",
            "Show status, run time and recent output of one worker or all workers, plus the queue.",
        )
        .with_schema(InputSchema::new().with_property("issue_id", issue_id("Only this worker"))),
        ToolDefinition::new("reprioritize", "Change the priority of an issue.").with_schema(
            InputSchema::new()
                .with_property("issue_id", issue_id("Issue to change"))
                .with_property("priority", priority())
                .with_required(&["issue_id", "priority"]),
        ),
        ToolDefinition::new(
            "delete_issue",
            "Delete an issue. Stops its worker and removes its worktree and branch.",
        )
        .with_schema(
            InputSchema::new()
                .with_property("issue_id", issue_id("Issue to delete"))
                .with_required(&["issue_id"]),
        ),
        ToolDefinition::new(
            "commit_files",
            "Commit files in an issue's worktree or the repository root. Commits all changes when no \
             files are given.",
        )
        .with_schema(
            InputSchema::new()
                .with_property("issue_id", issue_id("Worktree to commit in"))
                .with_property("message", json!({"type": "string"}))
                .with_property("files", json!({"type": "array", "items": {"type": "string"}}))
                .with_required(&["message"]),
        ),
        ToolDefinition::new(
            "read_file",
            "Read a file from the repository, or from an issue's worktree.",
        )
        .with_schema(
            InputSchema::new()
                .with_property("path", json!({"type": "string", "description": "Relative path"}))
                .with_property("issue_id", issue_id("Read from this worktree"))
                .with_required(&["path"]),
        ),
    ]
}
