// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Startup recovery of work orphaned by a previous run.

use std::fmt::Write as _;
use std::path::PathBuf;

use tracing::{info, warn};

use super::Orchestrator;
use crate::error::OrchestratorError;
use crate::issues::IssueStatus;

/// An issue reset to `open` because its worker is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredIssue {
    pub issue_id: u32,
    pub title: String,
    pub previous: IssueStatus,
    pub worktree: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset: Vec<RecoveredIssue>,
    /// Worktrees whose issue no longer exists.
    pub stray_worktrees: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty() && self.stray_worktrees.is_empty()
    }

    /// Operator-facing summary, `None` when there was nothing to recover.
    pub fn summary(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::from("[Startup recovery] The previous session ended with unfinished work.");
        for issue in &self.reset {
            let _ = write!(
                out,
                "\n- Issue #{} \"{}\" was {} with no running worker and has been reset to open. Worktree: {}",
                issue.issue_id,
                issue.title,
                issue.previous,
                issue.worktree.display()
            );
        }
        for path in &self.stray_worktrees {
            let _ = write!(out, "\n- Worktree {} belongs to an issue that no longer exists.", path.display());
        }
        out.push_str("\nRe-spawn or delete these issues as needed.");
        Some(out)
    }
}

impl Orchestrator {
    /// Reset issues whose worktree exists but whose worker is gone.
    ///
    /// Only `in_progress` and `review` issues are reset. The summary is also
    /// prepended to the next turn so the manager knows about it.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let worktrees = self.vcs.list_worktrees().await?;
        let scheduler = self.scheduler.lock().await;
        let mut report = RecoveryReport::default();

        for entry in worktrees {
            if scheduler.workers.contains_key(&entry.issue_id) {
                continue;
            }
            let Some(issue) = self.issues.get(entry.issue_id).await? else {
                report.stray_worktrees.push(entry.path);
                continue;
            };
            if !matches!(issue.status, IssueStatus::InProgress | IssueStatus::Review) {
                continue;
            }

            match self.issues.update_status(issue.id, IssueStatus::Open).await {
                Ok(_) => {
                    info!(issue_id = issue.id, previous = %issue.status, "Recovered orphaned issue");
                    report.reset.push(RecoveredIssue {
                        issue_id: issue.id,
                        title: issue.title,
                        previous: issue.status,
                        worktree: entry.path,
                    });
                }
                Err(e) => warn!(issue_id = issue.id, error = %e, "Failed to reset orphaned issue"),
            }
        }
        drop(scheduler);

        if let Some(summary) = report.summary() {
            self.conversation.lock().await.pending_context = Some(summary);
        }
        Ok(report)
    }
}
