// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Issues: records, the status state machine, storage and conflict detection.
//!
//! ```text
//!            +-------------+
//!   open --->| in_progress |---> review ---> done
//!    ^  \    +-------------+       |  \       |
//!    |   \      |     ^    \       |   +--> in_progress
//!    |    +-> blocked <+    +-> open      (and back to open)
//! ```
//!
//! Legal moves are listed by [`IssueStatus::successors`]; everything else,
//! including staying put, is rejected.

mod conflict;
mod store;
mod types;

pub use conflict::{
    conflict_warning, extract_paths, find_conflicts, is_path_prefix, path_tokens, Conflict,
};
pub use store::{FileIssueStore, IssueStore};
pub use types::{
    slugify, AgentLogEntry, Issue, IssueChange, IssueFilter, IssueStatus, IssueUpdate, NewIssue,
    Priority,
};
