// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Version control coordination.
//!
//! Each issue gets its own branch `issue/<id>-<slug>` checked out in a
//! dedicated worktree `<worktree_root>/issue-<id>-<slug>`.

mod git;

pub use git::GitCoordinator;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::VcsError;

/// A worktree created for an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// A worktree found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub issue_id: u32,
    pub branch: String,
    pub path: PathBuf,
}

/// Outcome of merging an issue branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub success: bool,
    pub message: String,
}

/// Branch name for an issue.
pub fn branch_name(issue_id: u32, slug: &str) -> String {
    format!("issue/{}-{}", issue_id, slug)
}

/// Worktree directory name for an issue.
pub fn worktree_dir_name(issue_id: u32, slug: &str) -> String {
    format!("issue-{}-{}", issue_id, slug)
}

/// Issue id encoded in a worktree directory name.
pub fn issue_id_from_dir_name(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("issue-")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    match rest.as_bytes().get(digits.len()) {
        Some(b'-') | None if !digits.is_empty() => digits.parse().ok(),
        _ => None,
    }
}

/// Worktree and branch operations the orchestrator needs.
#[async_trait]
pub trait VcsCoordinator: Send + Sync {
    /// Create the issue's worktree from `base`, or return the existing one.
    async fn create_worktree(&self, issue_id: u32, slug: &str, base: &str) -> Result<WorktreeInfo, VcsError>;

    /// Remove the issue's worktree and branch.
    async fn remove_worktree(&self, issue_id: u32, slug: &str) -> Result<(), VcsError>;

    /// Issue worktrees currently on disk.
    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, VcsError>;

    /// Changes in a worktree relative to `base`.
    async fn get_diff(&self, path: &Path, base: &str) -> Result<String, VcsError>;

    /// Merge the issue branch into `base`. Conflicts are reported, not raised.
    async fn merge(&self, issue_id: u32, slug: &str, base: &str) -> Result<MergeResult, VcsError>;

    /// Stage `files` (everything when empty) and commit. Returns the short hash.
    async fn commit(&self, path: &Path, message: &str, files: &[String]) -> Result<String, VcsError>;
}
