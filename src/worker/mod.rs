// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker agents: coding-agent subprocesses, one per issue worktree.

mod outcome;
mod supervisor;

pub use outcome::{
    blocked_reason, classify_outcome, WorkerOutcome, BLOCKED_PREFIX, COMPLETION_SENTINEL,
    RESULT_MARKER,
};
pub use supervisor::{Worker, WorkerEvent, WorkerSpec, WorkerStatus};
