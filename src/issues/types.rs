// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Issue records and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Review,
    Blocked,
    Done,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 5] = [
        Self::Open,
        Self::InProgress,
        Self::Review,
        Self::Blocked,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }

    /// Statuses reachable from this one in a single step.
    pub fn successors(&self) -> &'static [IssueStatus] {
        match self {
            Self::Open => &[Self::InProgress, Self::Blocked],
            Self::InProgress => &[Self::Review, Self::Blocked, Self::Open],
            Self::Review => &[Self::Done, Self::InProgress, Self::Open],
            Self::Blocked => &[Self::Open, Self::InProgress],
            Self::Done => &[Self::Open],
        }
    }

    pub fn can_transition_to(&self, next: IssueStatus) -> bool {
        self.successors().contains(&next)
    }

    /// Whether a worker may be spawned for an issue in this status.
    pub fn is_spawnable(&self) -> bool {
        self.can_transition_to(Self::InProgress) && *self != Self::Review
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown status '{}'", s))
    }
}

/// Scheduling priority. Ordering follows rank: `High < Medium < Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Sort rank, lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an issue's agent log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// A unit of work tracked by the issue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: u32,
    pub title: String,
    pub slug: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub specs: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub agent_log: Vec<AgentLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an issue.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub specs: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

/// Field updates. Status changes go through `update_status` instead.
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub specs: Option<Vec<String>>,
    pub acceptance_criteria: Option<Vec<String>>,
    /// Appended to the agent log.
    pub log: Option<String>,
}

impl IssueUpdate {
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            log: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub priority: Option<Priority>,
}

impl IssueFilter {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status),
            priority: None,
        }
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        self.status.map_or(true, |s| issue.status == s)
            && self.priority.map_or(true, |p| issue.priority == p)
    }
}

/// Change notification broadcast by the store.
#[derive(Debug, Clone)]
pub enum IssueChange {
    Created(Issue),
    Updated(Issue),
    StatusChanged {
        id: u32,
        from: IssueStatus,
        to: IssueStatus,
    },
    Deleted(u32),
}

/// Lowercase, dash-separated slug of at most 50 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for word in title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if slug.len() + word.len() + 1 > 50 && !slug.is_empty() {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word.to_ascii_lowercase());
    }
    slug.truncate(50);
    if slug.is_empty() {
        slug.push_str("issue");
    }
    slug
}
