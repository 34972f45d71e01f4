// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator callbacks and events.

use std::sync::Arc;

use serde::Serialize;

use crate::worker::WorkerOutcome;

/// A destructive tool call awaiting approval.
#[derive(Debug, Clone)]
pub struct ToolConfirmation {
    pub tool_name: String,
    /// What the call will do, in words.
    pub description: String,
    pub input: serde_json::Value,
}

/// Something the operator may want to see.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    WorkerStarted {
        issue_id: u32,
        endpoint: String,
    },
    WorkerQueued {
        issue_id: u32,
        position: usize,
    },
    WorkerFinished {
        issue_id: u32,
        outcome: WorkerOutcome,
    },
    /// A queued issue could not be started. A report turn follows.
    LaunchFailed {
        issue_id: u32,
        error: String,
    },
    /// A report turn was queued after a worker finished.
    ReportQueued {
        issue_id: u32,
    },
    TurnFailed {
        error: String,
    },
}

/// Hooks into the manager loop.
///
/// `Arc` so they can be handed to the background tasks that run turns.
#[derive(Clone, Default)]
pub struct OrchestratorCallbacks {
    /// Text segments of each manager reply, in order.
    pub on_text: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Before a tool runs (name, input).
    pub on_tool_call: Option<Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>>,
    /// After a tool ran (name, result, is_error).
    pub on_tool_result: Option<Arc<dyn Fn(&str, &str, bool) + Send + Sync>>,
    /// Approval of destructive tools outside yolo mode. Without one they are refused.
    pub on_confirm: Option<Arc<dyn Fn(&ToolConfirmation) -> bool + Send + Sync>>,
    pub on_event: Option<Arc<dyn Fn(&OrchestratorEvent) + Send + Sync>>,
}

impl std::fmt::Debug for OrchestratorCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorCallbacks")
            .field("on_text", &self.on_text.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .field("on_tool_result", &self.on_tool_result.is_some())
            .field("on_confirm", &self.on_confirm.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}
