// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Issue persistence.
//!
//! [`IssueStore`] is the contract the orchestrator works against.
//! [`FileIssueStore`] keeps one markdown file per issue, `NNN-slug.md`,
//! with the structured fields in YAML frontmatter and the description as
//! the body.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::types::{
    slugify, AgentLogEntry, Issue, IssueChange, IssueFilter, IssueStatus, IssueUpdate, NewIssue,
    Priority,
};
use crate::error::IssueError;

/// CRUD contract over issue records.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Create an issue with the next free id and status `open`.
    async fn create(&self, new: NewIssue) -> Result<Issue, IssueError>;

    /// All issues matching the filter, ordered by id.
    async fn list(&self, filter: &IssueFilter) -> Result<Vec<Issue>, IssueError>;

    async fn get(&self, id: u32) -> Result<Option<Issue>, IssueError>;

    /// Apply field updates.
    async fn update(&self, id: u32, update: IssueUpdate) -> Result<Issue, IssueError>;

    /// Move the issue along the state machine. Illegal moves leave it untouched.
    async fn update_status(&self, id: u32, status: IssueStatus) -> Result<Issue, IssueError>;

    async fn delete(&self, id: u32) -> Result<(), IssueError>;

    /// Receive change notifications.
    fn subscribe(&self) -> broadcast::Receiver<IssueChange>;
}

/// Frontmatter of an issue file.
#[derive(Debug, Serialize, Deserialize)]
struct Frontmatter {
    id: u32,
    title: String,
    status: IssueStatus,
    #[serde(default)]
    priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    specs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    agent_log: Vec<AgentLogEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Markdown-with-frontmatter issue store rooted at one directory.
pub struct FileIssueStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<IssueChange>,
}

impl FileIssueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(issue: &Issue) -> String {
        format!("{:03}-{}.md", issue.id, issue.slug)
    }

    /// Id encoded in a record file name.
    fn id_from_file_name(name: &str) -> Option<u32> {
        let stem = name.strip_suffix(".md")?;
        let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() || stem.as_bytes().get(digits.len()) != Some(&b'-') {
            return None;
        }
        digits.parse().ok()
    }

    fn render(issue: &Issue) -> Result<String, IssueError> {
        let front = Frontmatter {
            id: issue.id,
            title: issue.title.clone(),
            status: issue.status,
            priority: issue.priority,
            specs: issue.specs.clone(),
            acceptance_criteria: issue.acceptance_criteria.clone(),
            agent_log: issue.agent_log.clone(),
            created_at: issue.created_at,
            updated_at: issue.updated_at,
        };
        let yaml = serde_yaml::to_string(&front)?;
        Ok(format!("---\n{}---\n\n{}\n", yaml, issue.description.trim_end()))
    }

    fn parse(path: &Path, content: &str) -> Result<Issue, IssueError> {
        let invalid = |message: &str| IssueError::InvalidRecord {
            path: path.display().to_string(),
            message: message.to_string(),
        };

        let rest = content
            .strip_prefix("---\n")
            .or_else(|| content.strip_prefix("---\r\n"))
            .ok_or_else(|| invalid("missing frontmatter"))?;
        let end = rest.find("\n---").ok_or_else(|| invalid("unterminated frontmatter"))?;
        let (yaml, body) = rest.split_at(end);
        let body = body.trim_start_matches("\n---").trim_start_matches(['\r', '\n']);

        let front: Frontmatter =
            serde_yaml::from_str(yaml).map_err(|e| invalid(&e.to_string()))?;

        let slug = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.split_once('-').map(|(_, slug)| slug.to_string()))
            .unwrap_or_else(|| slugify(&front.title));

        Ok(Issue {
            id: front.id,
            title: front.title,
            slug,
            status: front.status,
            priority: front.priority,
            specs: front.specs,
            description: body.trim_end().to_string(),
            acceptance_criteria: front.acceptance_criteria,
            agent_log: front.agent_log,
            created_at: front.created_at,
            updated_at: front.updated_at,
        })
    }

    /// Paths of all record files, keyed by id.
    async fn record_paths(&self) -> Result<Vec<(u32, PathBuf)>, IssueError> {
        let mut paths = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(Self::id_from_file_name) {
                paths.push((id, entry.path()));
            }
        }
        paths.sort_by_key(|(id, _)| *id);
        Ok(paths)
    }

    async fn find_path(&self, id: u32) -> Result<Option<PathBuf>, IssueError> {
        Ok(self
            .record_paths()
            .await?
            .into_iter()
            .find(|(found, _)| *found == id)
            .map(|(_, path)| path))
    }

    async fn read(&self, path: &Path) -> Result<Issue, IssueError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(path, &content)
    }

    async fn write(&self, issue: &Issue) -> Result<(), IssueError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::file_name(issue));
        let tmp = path.with_extension("md.tmp");
        tokio::fs::write(&tmp, Self::render(issue)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, id: u32) -> Result<Issue, IssueError> {
        let path = self.find_path(id).await?.ok_or(IssueError::NotFound(id))?;
        self.read(&path).await
    }

    fn notify(&self, change: IssueChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl IssueStore for FileIssueStore {
    async fn create(&self, new: NewIssue) -> Result<Issue, IssueError> {
        let _guard = self.write_lock.lock().await;
        let id = self
            .record_paths()
            .await?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(1);
        let now = Utc::now();
        let issue = Issue {
            id,
            slug: slugify(&new.title),
            title: new.title,
            status: IssueStatus::Open,
            priority: new.priority,
            specs: new.specs,
            description: new.description,
            acceptance_criteria: new.acceptance_criteria,
            agent_log: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.write(&issue).await?;
        info!(id, title = %issue.title, "Issue created");
        self.notify(IssueChange::Created(issue.clone()));
        Ok(issue)
    }

    async fn list(&self, filter: &IssueFilter) -> Result<Vec<Issue>, IssueError> {
        let mut issues = Vec::new();
        for (_, path) in self.record_paths().await? {
            match self.read(&path).await {
                Ok(issue) if filter.matches(&issue) => issues.push(issue),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable issue"),
            }
        }
        Ok(issues)
    }

    async fn get(&self, id: u32) -> Result<Option<Issue>, IssueError> {
        match self.find_path(id).await? {
            Some(path) => self.read(&path).await.map(Some),
            None => Ok(None),
        }
    }

    async fn update(&self, id: u32, update: IssueUpdate) -> Result<Issue, IssueError> {
        let _guard = self.write_lock.lock().await;
        let mut issue = self.load(id).await?;
        let now = Utc::now();

        if let Some(title) = update.title {
            issue.title = title;
        }
        if let Some(description) = update.description {
            issue.description = description;
        }
        if let Some(priority) = update.priority {
            issue.priority = priority;
        }
        if let Some(specs) = update.specs {
            issue.specs = specs;
        }
        if let Some(criteria) = update.acceptance_criteria {
            issue.acceptance_criteria = criteria;
        }
        if let Some(message) = update.log {
            issue.agent_log.push(AgentLogEntry { at: now, message });
        }
        issue.updated_at = now;

        self.write(&issue).await?;
        debug!(id, "Issue updated");
        self.notify(IssueChange::Updated(issue.clone()));
        Ok(issue)
    }

    async fn update_status(&self, id: u32, status: IssueStatus) -> Result<Issue, IssueError> {
        let _guard = self.write_lock.lock().await;
        let mut issue = self.load(id).await?;
        let from = issue.status;
        if !from.can_transition_to(status) {
            return Err(IssueError::InvalidTransition { id, from, to: status });
        }
        issue.status = status;
        issue.updated_at = Utc::now();
        self.write(&issue).await?;
        info!(id, %from, to = %status, "Issue status changed");
        self.notify(IssueChange::StatusChanged { id, from, to: status });
        Ok(issue)
    }

    async fn delete(&self, id: u32) -> Result<(), IssueError> {
        let _guard = self.write_lock.lock().await;
        let path = self.find_path(id).await?.ok_or(IssueError::NotFound(id))?;
        tokio::fs::remove_file(&path).await?;
        info!(id, "Issue deleted");
        self.notify(IssueChange::Deleted(id));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<IssueChange> {
        self.changes.subscribe()
    }
}
