// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Manager tool catalog.
//!
//! Tools are the only way the manager model can change anything. Every tool
//! is a variant of [`ToolRequest`] carrying a typed input, so dispatch is a
//! single exhaustive match in the orchestrator.
//!
//! ```rust,ignore
//! let request = ToolRequest::parse(&call)?;
//! if request.is_destructive() && !yolo {
//!     approve(&request.describe());
//! }
//! ```

mod catalog;

pub use catalog::definitions;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::issues::{IssueStatus, Priority};
use crate::types::ToolCall;

/// Returned by a destructive tool the user declined.
pub const CANCELLED: &str = "Action cancelled by user.";

/// Maximum bytes of a file returned by `read_file`.
pub const READ_FILE_MAX_BYTES: usize = 50 * 1024;

/// Maximum lines of command output returned by `run_tests`.
pub const TEST_OUTPUT_MAX_LINES: usize = 80;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateIssueInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub specs: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListIssuesInput {
    #[serde(default)]
    pub status: Option<IssueStatus>,
}

/// Input of tools that act on exactly one issue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IssueRef {
    pub issue_id: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunTestsInput {
    #[serde(default)]
    pub issue_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateSpecInput {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerStatusInput {
    #[serde(default)]
    pub issue_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReprioritizeInput {
    pub issue_id: u32,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommitFilesInput {
    #[serde(default)]
    pub issue_id: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadFileInput {
    pub path: String,
    #[serde(default)]
    pub issue_id: Option<u32>,
}

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    CreateIssue(CreateIssueInput),
    ListIssues(ListIssuesInput),
    SpawnWorker(IssueRef),
    ReviewDiff(IssueRef),
    MergeIssue(IssueRef),
    RunTests(RunTestsInput),
    CreateSpec(CreateSpecInput),
    ListSpecs,
    WorkerStatus(WorkerStatusInput),
    Reprioritize(ReprioritizeInput),
    DeleteIssue(IssueRef),
    CommitFiles(CommitFilesInput),
    ReadFile(ReadFileInput),
}

impl ToolRequest {
    /// Parse a model tool call. Errors are messages meant for the model.
    pub fn parse(call: &ToolCall) -> Result<Self, String> {
        let input = &call.input;
        let request = match call.name.as_str() {
            "create_issue" => Self::CreateIssue(parse_arguments(&call.name, input)?),
            "list_issues" => Self::ListIssues(parse_arguments(&call.name, input)?),
            "spawn_worker" => Self::SpawnWorker(parse_arguments(&call.name, input)?),
            "review_diff" => Self::ReviewDiff(parse_arguments(&call.name, input)?),
            "merge_issue" => Self::MergeIssue(parse_arguments(&call.name, input)?),
            "run_tests" => Self::RunTests(parse_arguments(&call.name, input)?),
            "create_spec" => Self::CreateSpec(parse_arguments(&call.name, input)?),
            "list_specs" => Self::ListSpecs,
            "worker_status" => Self::WorkerStatus(parse_arguments(&call.name, input)?),
            "reprioritize" => Self::Reprioritize(parse_arguments(&call.name, input)?),
            "delete_issue" => Self::DeleteIssue(parse_arguments(&call.name, input)?),
            "commit_files" => Self::CommitFiles(parse_arguments(&call.name, input)?),
            "read_file" => Self::ReadFile(parse_arguments(&call.name, input)?),
            other => return Err(format!("Unknown tool: {}", other)),
        };
        Ok(request)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateIssue(_) => "create_issue",
            Self::ListIssues(_) => "list_issues",
            Self::SpawnWorker(_) => "spawn_worker",
            Self::ReviewDiff(_) => "review_diff",
            Self::MergeIssue(_) => "merge_issue",
            Self::RunTests(_) => "run_tests",
            Self::CreateSpec(_) => "create_spec",
            Self::ListSpecs => "list_specs",
            Self::WorkerStatus(_) => "worker_status",
            Self::Reprioritize(_) => "reprioritize",
            Self::DeleteIssue(_) => "delete_issue",
            Self::CommitFiles(_) => "commit_files",
            Self::ReadFile(_) => "read_file",
        }
    }

    /// Whether the user must approve this call outside yolo mode.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::MergeIssue(_) | Self::DeleteIssue(_) | Self::CommitFiles(_) | Self::RunTests(_)
        )
    }

    /// What the call will do, for the approval prompt.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateIssue(i) => format!("Create issue \"{}\"", i.title),
            Self::ListIssues(_) => "List issues".to_string(),
            Self::SpawnWorker(i) => format!("Spawn a worker for issue #{}", i.issue_id),
            Self::ReviewDiff(i) => format!("Show the diff of issue #{}", i.issue_id),
            Self::MergeIssue(i) => format!("Merge issue #{} into the base branch", i.issue_id),
            Self::RunTests(i) => match i.issue_id {
                Some(id) => format!("Run the test command in the worktree of issue #{}", id),
                None => "Run the test command in the repository root".to_string(),
            },
            Self::CreateSpec(i) => format!("Write spec {}", i.name),
            Self::ListSpecs => "List specs".to_string(),
            Self::WorkerStatus(_) => "Show worker status".to_string(),
            Self::Reprioritize(i) => format!("Set priority of issue #{} to {}", i.issue_id, i.priority),
            Self::DeleteIssue(i) => format!(
                "Delete issue #{}, stopping its worker and removing its worktree",
                i.issue_id
            ),
            Self::CommitFiles(i) => {
                let place = match i.issue_id {
                    Some(id) => format!("the worktree of issue #{}", id),
                    None => "the repository root".to_string(),
                };
                let files = if i.files.is_empty() {
                    "all changes".to_string()
                } else {
                    i.files.join(", ")
                };
                format!("Commit {} in {} with message \"{}\"", files, place, i.message)
            }
            Self::ReadFile(i) => format!("Read {}", i.path),
        }
    }
}

/// Deserialize tool arguments into a typed input.
pub fn parse_arguments<T: DeserializeOwned>(tool: &str, input: &serde_json::Value) -> Result<T, String> {
    // Models sometimes send `null` for tools without required fields.
    let input = if input.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        input.clone()
    };
    serde_json::from_value(input).map_err(|err| format!("Invalid input for {}: {}", tool, err))
}

/// Truncate text to a maximum byte length, respecting UTF-8 boundaries.
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated, {} bytes total]", &text[..end], text.len())
}

/// Keep the last `max_lines` lines of command output.
pub fn tail_lines(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= max_lines {
        return output.trim_end().to_string();
    }
    let omitted = lines.len() - max_lines;
    format!("... [{} lines omitted]\n{}", omitted, lines[omitted..].join("\n"))
}
