// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool handlers. Each returns text for the model and never fails.

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use super::prompt::format_duration;
use super::Orchestrator;
use crate::issues::{Issue, IssueFilter, IssueStatus, IssueUpdate, NewIssue};
use crate::tools::{
    tail_lines, truncate_text, CommitFilesInput, CreateIssueInput, CreateSpecInput, ReadFileInput,
    ReprioritizeInput, ToolRequest, READ_FILE_MAX_BYTES, TEST_OUTPUT_MAX_LINES,
};

/// Upper bound on one `run_tests` invocation.
const TEST_TIMEOUT: Duration = Duration::from_secs(600);

impl Orchestrator {
    /// Run a tool without the confirmation gate.
    pub async fn dispatch(&self, request: ToolRequest) -> String {
        match request {
            ToolRequest::CreateIssue(input) => self.create_issue(input).await,
            ToolRequest::ListIssues(input) => self.list_issues(input.status).await,
            ToolRequest::SpawnWorker(input) => self.spawn_worker(input.issue_id).await,
            ToolRequest::ReviewDiff(input) => self.review_diff(input.issue_id).await,
            ToolRequest::MergeIssue(input) => self.merge_issue(input.issue_id).await,
            ToolRequest::RunTests(input) => self.run_tests(input.issue_id).await,
            ToolRequest::CreateSpec(input) => self.create_spec(input).await,
            ToolRequest::ListSpecs => self.list_specs().await,
            ToolRequest::WorkerStatus(input) => self.worker_status(input.issue_id).await,
            ToolRequest::Reprioritize(input) => self.reprioritize(input).await,
            ToolRequest::DeleteIssue(input) => self.delete_issue(input.issue_id).await,
            ToolRequest::CommitFiles(input) => self.commit_files(input).await,
            ToolRequest::ReadFile(input) => self.read_file(input).await,
        }
    }

    async fn load_issue(&self, issue_id: u32) -> Result<Issue, String> {
        match self.issues.get(issue_id).await {
            Ok(Some(issue)) => Ok(issue),
            Ok(None) => Err(format!("Issue #{} not found.", issue_id)),
            Err(e) => Err(format!("Failed to load issue #{}: {}", issue_id, e)),
        }
    }

    /// The issue's worktree: the live worker's, or one found on disk.
    async fn worktree_for(&self, issue_id: u32) -> Option<PathBuf> {
        if let Some(active) = self.scheduler.lock().await.workers.get(&issue_id) {
            return Some(active.worktree.clone());
        }
        match self.vcs.list_worktrees().await {
            Ok(entries) => entries.into_iter().find(|e| e.issue_id == issue_id).map(|e| e.path),
            Err(e) => {
                warn!(issue_id, error = %e, "Failed to list worktrees");
                None
            }
        }
    }

    /// Working directory for tools with an optional issue.
    async fn workdir(&self, issue_id: Option<u32>) -> Result<PathBuf, String> {
        match issue_id {
            None => Ok(self.repo_root.clone()),
            Some(id) => {
                self.load_issue(id).await?;
                self.worktree_for(id)
                    .await
                    .ok_or_else(|| format!("Issue #{} has no worktree.", id))
            }
        }
    }

    async fn create_issue(&self, input: CreateIssueInput) -> String {
        let new = NewIssue {
            title: input.title,
            description: input.description,
            priority: input.priority.unwrap_or_default(),
            specs: input.specs,
            acceptance_criteria: input.acceptance_criteria,
        };
        if new.title.trim().is_empty() {
            return "An issue needs a title.".to_string();
        }
        match self.issues.create(new).await {
            Ok(issue) => format!(
                "Created issue #{} \"{}\" ({} priority).",
                issue.id, issue.title, issue.priority
            ),
            Err(e) => format!("Failed to create issue: {}", e),
        }
    }

    async fn list_issues(&self, status: Option<IssueStatus>) -> String {
        let filter = IssueFilter {
            status,
            priority: None,
        };
        let issues = match self.issues.list(&filter).await {
            Ok(issues) => issues,
            Err(e) => return format!("Failed to list issues: {}", e),
        };
        if issues.is_empty() {
            return match status {
                Some(status) => format!("No {} issues.", status),
                None => "No issues.".to_string(),
            };
        }

        let scheduler = self.scheduler.lock().await;
        let mut out = String::new();
        for issue in &issues {
            let _ = write!(
                out,
                "#{} [{}] ({}) {}",
                issue.id, issue.status, issue.priority, issue.title
            );
            if scheduler.workers.contains_key(&issue.id) {
                out.push_str(" - worker running");
            } else if let Some(position) = scheduler.queue.position(issue.id) {
                let _ = write!(out, " - queued at position {}", position);
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    async fn review_diff(&self, issue_id: u32) -> String {
        if let Err(message) = self.load_issue(issue_id).await {
            return message;
        }
        let Some(path) = self.worktree_for(issue_id).await else {
            return format!("Issue #{} has no worktree to review.", issue_id);
        };
        match self.vcs.get_diff(&path, &self.config.base_branch).await {
            Ok(diff) if diff.trim().is_empty() => format!(
                "No changes in issue #{} relative to {}.",
                issue_id, self.config.base_branch
            ),
            Ok(diff) => diff,
            Err(e) => format!("Failed to diff issue #{}: {}", issue_id, e),
        }
    }

    async fn merge_issue(&self, issue_id: u32) -> String {
        let issue = match self.load_issue(issue_id).await {
            Ok(issue) => issue,
            Err(message) => return message,
        };
        // Held for the whole merge so no worker starts on this issue meanwhile.
        let scheduler = self.scheduler.lock().await;
        if scheduler.workers.contains_key(&issue_id) {
            return format!(
                "Issue #{} still has a running worker. Wait for it to finish or delete the issue.",
                issue_id
            );
        }
        if !matches!(issue.status, IssueStatus::Review | IssueStatus::InProgress) {
            return format!(
                "Issue #{} is {}. Only issues in review can be merged.",
                issue_id, issue.status
            );
        }

        let result = match self
            .vcs
            .merge(issue_id, &issue.slug, &self.config.base_branch)
            .await
        {
            Ok(result) => result,
            Err(e) => return format!("Failed to merge issue #{}: {}", issue_id, e),
        };
        if !result.success {
            return format!("Merge of issue #{} failed: {}", issue_id, result.message);
        }

        if issue.status == IssueStatus::InProgress {
            if let Err(e) = self.issues.update_status(issue_id, IssueStatus::Review).await {
                return format!("Merged, but failed to update issue #{}: {}", issue_id, e);
            }
        }
        if let Err(e) = self.issues.update_status(issue_id, IssueStatus::Done).await {
            return format!("Merged, but failed to mark issue #{} done: {}", issue_id, e);
        }
        let log = format!("Merged into {}", self.config.base_branch);
        if let Err(e) = self.issues.update(issue_id, IssueUpdate::log(log)).await {
            warn!(issue_id, error = %e, "Failed to append to agent log");
        }
        drop(scheduler);

        let mut message = format!(
            "Merged issue #{} into {}. {}",
            issue_id,
            self.config.base_branch,
            result.message.trim()
        );
        if let Err(e) = self.vcs.remove_worktree(issue_id, &issue.slug).await {
            let _ = write!(message, "\nThe worktree could not be removed: {}", e);
        }
        info!(issue_id, "Issue merged");
        message.trim_end().to_string()
    }

    async fn run_tests(&self, issue_id: Option<u32>) -> String {
        let Some(command) = self.config.test_command.clone() else {
            return "No test command is configured. Set testCommand in the config.".to_string();
        };
        let dir = match self.workdir(issue_id).await {
            Ok(dir) => dir,
            Err(message) => return message,
        };

        info!(command = %command, dir = %dir.display(), "Running tests");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command).current_dir(&dir).kill_on_drop(true);
        let output = match tokio::time::timeout(TEST_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return format!("Failed to run `{}`: {}", command, e),
            Err(_) => {
                return format!(
                    "`{}` did not finish within {}.",
                    command,
                    format_duration(TEST_TIMEOUT)
                )
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let verdict = match output.status.code() {
            Some(0) => "Tests passed".to_string(),
            Some(code) => format!("Tests failed (exit code {})", code),
            None => "Tests were terminated by a signal".to_string(),
        };
        format!("{}: `{}`\n{}", verdict, command, tail_lines(&combined, TEST_OUTPUT_MAX_LINES))
            .trim_end()
            .to_string()
    }

    async fn create_spec(&self, input: CreateSpecInput) -> String {
        let name = input.name.trim().trim_end_matches(".md");
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
        {
            return format!("Invalid spec name \"{}\". Use a plain file name.", input.name);
        }
        let path = self.config.specs_dir.join(format!("{}.md", name));
        if let Err(e) = tokio::fs::create_dir_all(&self.config.specs_dir).await {
            return format!("Failed to create {}: {}", self.config.specs_dir.display(), e);
        }
        match tokio::fs::write(&path, &input.content).await {
            Ok(()) => format!("Wrote spec {}.", self.display_path(&path)),
            Err(e) => format!("Failed to write {}: {}", path.display(), e),
        }
    }

    async fn list_specs(&self) -> String {
        let mut entries = match tokio::fs::read_dir(&self.config.specs_dir).await {
            Ok(entries) => entries,
            Err(_) => return "No specs yet.".to_string(),
        };
        let mut specs = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                specs.push(format!("{} ({} bytes)", self.display_path(&path), size));
            }
        }
        if specs.is_empty() {
            return "No specs yet.".to_string();
        }
        specs.sort();
        specs.join("\n")
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.repo_root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    async fn worker_status(&self, issue_id: Option<u32>) -> String {
        let scheduler = self.scheduler.lock().await;
        let tail = self.config.tail_lines;

        let describe = |id: u32, out: &mut String, with_tail: bool| {
            if let Some(active) = scheduler.workers.get(&id) {
                let worker = &active.worker;
                let _ = write!(
                    out,
                    "#{} \"{}\": {} for {} on {} (branch {})",
                    id,
                    active.title,
                    worker.status().as_str(),
                    format_duration(worker.elapsed()),
                    active.slot.endpoint_name(),
                    active.branch
                );
                if with_tail {
                    let lines = worker.tail(tail);
                    if !lines.is_empty() {
                        let _ = write!(out, "\nRecent output:\n```\n{}\n```", lines.join("\n"));
                    }
                }
            }
        };

        let mut out = String::new();
        match issue_id {
            Some(id) => {
                if scheduler.workers.contains_key(&id) {
                    describe(id, &mut out, true);
                } else if let Some(position) = scheduler.queue.position(id) {
                    let _ = write!(out, "Issue #{} is queued at position {}.", id, position);
                } else {
                    let _ = write!(out, "No worker for issue #{}.", id);
                }
            }
            None => {
                let mut ids: Vec<u32> = scheduler.workers.keys().copied().collect();
                ids.sort_unstable();
                let _ = writeln!(out, "Workers: {}/{} running", ids.len(), self.config.max_workers);
                for id in ids {
                    out.push_str("- ");
                    describe(id, &mut out, false);
                    out.push('\n');
                }
                if !scheduler.queue.is_empty() {
                    out.push_str("Queue:\n");
                    for (i, entry) in scheduler.queue.iter().enumerate() {
                        let _ = writeln!(out, "{}. #{} ({} priority)", i + 1, entry.issue_id, entry.priority);
                    }
                }
            }
        }
        out.trim_end().to_string()
    }

    async fn reprioritize(&self, input: ReprioritizeInput) -> String {
        let issue = match self.issues.update(input.issue_id, IssueUpdate::priority(input.priority)).await {
            Ok(issue) => issue,
            Err(e) => return format!("Failed to reprioritize issue #{}: {}", input.issue_id, e),
        };
        let position = self
            .scheduler
            .lock()
            .await
            .queue
            .reprioritize(issue.id, input.priority);
        match position {
            Some(position) => format!(
                "Issue #{} is now {} priority, queue position {}.",
                issue.id, issue.priority, position
            ),
            None => format!("Issue #{} is now {} priority.", issue.id, issue.priority),
        }
    }

    async fn delete_issue(&self, issue_id: u32) -> String {
        let issue = match self.load_issue(issue_id).await {
            Ok(issue) => issue,
            Err(message) => return message,
        };

        let mut scheduler = self.scheduler.lock().await;
        let mut notes = Vec::new();
        scheduler.queue.remove(issue_id);

        if let Some(active) = scheduler.workers.remove(&issue_id) {
            let worker = Arc::clone(&active.worker);
            worker.kill().await;
            self.router.release_worker_slot(active.slot);
            notes.push("stopped its worker".to_string());
        }

        let has_worktree = match self.vcs.list_worktrees().await {
            Ok(entries) => entries.iter().any(|e| e.issue_id == issue_id),
            Err(_) => true,
        };
        if has_worktree {
            match self.vcs.remove_worktree(issue_id, &issue.slug).await {
                Ok(()) => notes.push("removed its worktree".to_string()),
                Err(e) => notes.push(format!("could not remove its worktree ({})", e)),
            }
        }

        if let Err(e) = self.issues.delete(issue_id).await {
            return format!("Failed to delete issue #{}: {}", issue_id, e);
        }
        let started = self.drain_queue(&mut scheduler).await;
        drop(scheduler);

        info!(issue_id, "Issue deleted");
        let mut message = format!("Deleted issue #{} \"{}\"", issue_id, issue.title);
        if !notes.is_empty() {
            let _ = write!(message, " and {}", notes.join(", "));
        }
        message.push('.');
        if !started.is_empty() {
            let ids: Vec<String> = started.iter().map(|id| format!("#{}", id)).collect();
            let _ = write!(message, " Started queued issue {}.", ids.join(", "));
        }
        message
    }

    async fn commit_files(&self, input: CommitFilesInput) -> String {
        if input.message.trim().is_empty() {
            return "A commit needs a message.".to_string();
        }
        let dir = match self.workdir(input.issue_id).await {
            Ok(dir) => dir,
            Err(message) => return message,
        };
        match self.vcs.commit(&dir, &input.message, &input.files).await {
            Ok(hash) => format!("Committed {} in {}.", hash, self.display_path(&dir)),
            Err(e) => format!("Commit failed: {}", e),
        }
    }

    async fn read_file(&self, input: ReadFileInput) -> String {
        let root = match self.workdir(input.issue_id).await {
            Ok(dir) => dir,
            Err(message) => return message,
        };
        let relative = Path::new(&input.path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return format!("Refusing to read {}: paths must stay inside the repository.", input.path);
        }

        let path = root.join(relative);
        // Symlinks may still point outside.
        match (tokio::fs::canonicalize(&root).await, tokio::fs::canonicalize(&path).await) {
            (Ok(root), Ok(resolved)) if !resolved.starts_with(&root) => {
                return format!("Refusing to read {}: it resolves outside the repository.", input.path);
            }
            (_, Err(e)) => return format!("Cannot read {}: {}", input.path, e),
            _ => {}
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => truncate_text(&String::from_utf8_lossy(&bytes), READ_FILE_MAX_BYTES),
            Err(e) => format!("Cannot read {}: {}", input.path, e),
        }
    }
}
