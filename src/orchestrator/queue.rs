// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Priority queue of issues waiting for a worker slot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::issues::Priority;

/// An issue waiting for a free worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedWorker {
    pub issue_id: u32,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
}

impl QueuedWorker {
    pub fn new(issue_id: u32, priority: Priority) -> Self {
        Self {
            issue_id,
            priority,
            queued_at: Utc::now(),
        }
    }
}

/// Kept sorted by priority rank. Entries of equal priority stay in arrival order.
#[derive(Debug, Default)]
pub struct WorkerQueue {
    entries: Vec<QueuedWorker>,
}

impl WorkerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Returns its 1-based position.
    pub fn push(&mut self, entry: QueuedWorker) -> usize {
        let id = entry.issue_id;
        self.entries.push(entry);
        self.resort();
        self.position(id).unwrap_or(self.entries.len())
    }

    /// Put an entry back at the head of its priority band.
    pub fn push_front(&mut self, entry: QueuedWorker) {
        self.entries.insert(0, entry);
        self.resort();
    }

    /// Take the highest-priority entry.
    pub fn pop(&mut self) -> Option<QueuedWorker> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn remove(&mut self, issue_id: u32) -> Option<QueuedWorker> {
        let index = self.entries.iter().position(|e| e.issue_id == issue_id)?;
        Some(self.entries.remove(index))
    }

    /// 1-based position of an issue.
    pub fn position(&self, issue_id: u32) -> Option<usize> {
        self.entries.iter().position(|e| e.issue_id == issue_id).map(|i| i + 1)
    }

    pub fn contains(&self, issue_id: u32) -> bool {
        self.position(issue_id).is_some()
    }

    /// Change a queued issue's priority. Returns its new position.
    pub fn reprioritize(&mut self, issue_id: u32, priority: Priority) -> Option<usize> {
        let entry = self.entries.iter_mut().find(|e| e.issue_id == issue_id)?;
        entry.priority = priority;
        self.resort();
        self.position(issue_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedWorker> {
        self.entries.iter()
    }

    fn resort(&mut self) {
        // Vec::sort_by_key is stable.
        self.entries.sort_by_key(|e| e.priority.rank());
    }
}
