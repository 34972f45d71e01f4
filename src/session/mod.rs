// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conversation persistence for the manager agent.

mod log;

pub use log::{ConversationLog, EntryKind, SCHEMA_VERSION};

use std::path::{Path, PathBuf};

/// Default location of the conversation database inside a workspace.
pub fn default_log_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".conductor").join("conversation.db")
}
