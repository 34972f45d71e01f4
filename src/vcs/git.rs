// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `git worktree` based coordinator.
//!
//! # Directory Structure
//!
//! ```text
//! /project/                          # Main repo, base branch checked out
//! ├── .git/
//! └── .conductor/worktrees/
//!     ├── issue-1-add-login/         # branch issue/1-add-login
//!     └── issue-2-fix-session/       # branch issue/2-fix-session
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    branch_name, issue_id_from_dir_name, worktree_dir_name, MergeResult, VcsCoordinator,
    WorktreeEntry, WorktreeInfo,
};
use crate::error::VcsError;

/// Maximum diff size returned to the model.
const MAX_DIFF_CHARS: usize = 60_000;

/// Git worktree coordinator for a single repository.
pub struct GitCoordinator {
    repo_root: PathBuf,
    worktree_root: PathBuf,
    /// Serializes operations that touch the main checkout.
    repo_lock: Mutex<()>,
}

impl GitCoordinator {
    pub fn new(repo_root: impl Into<PathBuf>, worktree_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_root: worktree_root.into(),
            repo_lock: Mutex::new(()),
        }
    }

    fn worktree_path(&self, issue_id: u32, slug: &str) -> PathBuf {
        self.worktree_root.join(worktree_dir_name(issue_id, slug))
    }

    /// Run a git command in `dir` and return trimmed stdout.
    async fn git_in(dir: &Path, args: &[&str]) -> Result<String, VcsError> {
        debug!(dir = %dir.display(), ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Err(VcsError::Git(if stderr.is_empty() { stdout } else { stderr }))
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        Self::git_in(&self.repo_root, args).await
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        self.git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .await
            .is_ok()
    }

    /// (path, branch) pairs from `git worktree list --porcelain`.
    async fn git_worktrees(&self) -> Result<Vec<(PathBuf, Option<String>)>, VcsError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output))
    }

    /// Commit anything left uncommitted in a worktree before merging.
    async fn commit_leftovers(&self, path: &Path, issue_id: u32) -> Result<(), VcsError> {
        let status = Self::git_in(path, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(());
        }
        info!(issue_id, "Committing uncommitted worker changes before merge");
        Self::git_in(path, &["add", "-A"]).await?;
        Self::git_in(
            path,
            &["commit", "-m", &format!("Uncommitted changes for issue #{}", issue_id)],
        )
        .await?;
        Ok(())
    }
}

fn parse_worktree_list(output: &str) -> Vec<(PathBuf, Option<String>)> {
    let mut entries = Vec::new();
    let mut current: Option<(PathBuf, Option<String>)> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some((PathBuf::from(path), None));
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some((_, ref mut b)) = current {
                *b = Some(branch.to_string());
            }
        }
    }
    entries.extend(current);
    entries
}

#[async_trait]
impl VcsCoordinator for GitCoordinator {
    async fn create_worktree(&self, issue_id: u32, slug: &str, base: &str) -> Result<WorktreeInfo, VcsError> {
        let _guard = self.repo_lock.lock().await;
        let path = self.worktree_path(issue_id, slug);
        let branch = branch_name(issue_id, slug);

        // A registered worktree has a `.git` link file at its root.
        if path.join(".git").is_file() {
            debug!(issue_id, path = %path.display(), "Reusing existing worktree");
            return Ok(WorktreeInfo { path, branch });
        }

        tokio::fs::create_dir_all(&self.worktree_root).await?;
        let _ = self.git(&["worktree", "prune"]).await;
        let path_str = path.to_string_lossy().to_string();

        let result = if self.branch_exists(&branch).await {
            self.git(&["worktree", "add", &path_str, &branch]).await
        } else {
            if !self.branch_exists(base).await {
                return Err(VcsError::BranchNotFound(base.to_string()));
            }
            self.git(&["worktree", "add", "-b", &branch, &path_str, base]).await
        };

        match result {
            Ok(_) => {
                info!(issue_id, branch = %branch, path = %path.display(), "Worktree created");
                Ok(WorktreeInfo { path, branch })
            }
            Err(e) => Err(VcsError::WorktreeCreationFailed(e.to_string())),
        }
    }

    async fn remove_worktree(&self, issue_id: u32, slug: &str) -> Result<(), VcsError> {
        let _guard = self.repo_lock.lock().await;
        let path = self.worktree_path(issue_id, slug);
        let path_str = path.to_string_lossy().to_string();

        if let Err(e) = self.git(&["worktree", "remove", "--force", &path_str]).await {
            warn!(issue_id, error = %e, "git worktree remove failed, removing directory");
            if path.exists() {
                tokio::fs::remove_dir_all(&path).await?;
            }
            let _ = self.git(&["worktree", "prune"]).await;
        }

        let branch = branch_name(issue_id, slug);
        if self.branch_exists(&branch).await {
            self.git(&["branch", "-D", &branch]).await?;
        }
        info!(issue_id, "Worktree removed");
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, VcsError> {
        let mut entries = Vec::new();
        let canonical_root = tokio::fs::canonicalize(&self.worktree_root)
            .await
            .unwrap_or_else(|_| self.worktree_root.clone());
        for (path, branch) in self.git_worktrees().await? {
            if !path.starts_with(&self.worktree_root) && !path.starts_with(&canonical_root) {
                continue;
            }
            let issue_id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(issue_id_from_dir_name);
            if let Some(issue_id) = issue_id {
                entries.push(WorktreeEntry {
                    issue_id,
                    branch: branch.unwrap_or_default(),
                    path,
                });
            }
        }
        Ok(entries)
    }

    async fn get_diff(&self, path: &Path, base: &str) -> Result<String, VcsError> {
        let stat = Self::git_in(path, &["diff", "--stat", base]).await?;
        let diff = Self::git_in(path, &["diff", base]).await?;
        let untracked = Self::git_in(path, &["ls-files", "--others", "--exclude-standard"]).await?;

        let mut out = String::new();
        if stat.is_empty() && untracked.is_empty() {
            return Ok(format!("No changes relative to {}.", base));
        }
        if !stat.is_empty() {
            out.push_str(&stat);
            out.push_str("\n\n");
        }
        if !untracked.is_empty() {
            out.push_str("Untracked files:\n");
            out.push_str(&untracked);
            out.push_str("\n\n");
        }
        if diff.len() > MAX_DIFF_CHARS {
            let mut cut = MAX_DIFF_CHARS;
            while !diff.is_char_boundary(cut) {
                cut -= 1;
            }
            out.push_str(&diff[..cut]);
            out.push_str(&format!("\n... [diff truncated, {} more bytes]", diff.len() - cut));
        } else {
            out.push_str(&diff);
        }
        Ok(out)
    }

    async fn merge(&self, issue_id: u32, slug: &str, base: &str) -> Result<MergeResult, VcsError> {
        let path = self.worktree_path(issue_id, slug);
        if path.exists() {
            self.commit_leftovers(&path, issue_id).await?;
        }

        let _guard = self.repo_lock.lock().await;
        let branch = branch_name(issue_id, slug);
        if !self.branch_exists(&branch).await {
            return Err(VcsError::BranchNotFound(branch));
        }

        let current = self.git(&["branch", "--show-current"]).await?;
        if current != base {
            self.git(&["checkout", base]).await?;
        }

        let message = format!("Merge issue #{}: {}", issue_id, slug);
        match self.git(&["merge", "--no-ff", "-m", &message, &branch]).await {
            Ok(output) => {
                info!(issue_id, branch = %branch, base, "Merged");
                Ok(MergeResult {
                    success: true,
                    message: if output.is_empty() { message } else { output },
                })
            }
            Err(e) => {
                warn!(issue_id, error = %e, "Merge failed, aborting");
                let _ = self.git(&["merge", "--abort"]).await;
                Ok(MergeResult {
                    success: false,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn commit(&self, path: &Path, message: &str, files: &[String]) -> Result<String, VcsError> {
        if files.is_empty() {
            Self::git_in(path, &["add", "-A"]).await?;
        } else {
            let mut args = vec!["add", "--"];
            args.extend(files.iter().map(String::as_str));
            Self::git_in(path, &args).await?;
        }
        Self::git_in(path, &["commit", "-m", message]).await?;
        Self::git_in(path, &["rev-parse", "--short", "HEAD"]).await
    }
}
