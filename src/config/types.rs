// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! `WorkspaceConfig` is the on-disk shape (every field optional, camelCase),
//! `ResolvedConfig` is the merged result with defaults filled in.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default model used when neither config nor CLI names one.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default Anthropic API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Workspace configuration for Conductor.
/// Can be defined in .conductor.json, .conductor/config.json or conductor.yaml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// LLM endpoints shared by the manager and the workers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<EndpointConfig>>,

    /// Model name for manager turns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Maximum number of concurrently running workers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Maximum model calls per manager turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,

    /// Skip confirmation for destructive tools and lift the iteration cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yolo: Option<bool>,

    /// Branch that worktrees are created from and merged into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    /// Directory holding issue records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues_dir: Option<String>,

    /// Directory holding spec documents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specs_dir: Option<String>,

    /// Directory under which worktrees are created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<String>,

    /// Worker subprocess command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerCommandConfig>,

    /// Command used by the run_tests tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,

    /// Seconds between endpoint health sweeps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_interval_secs: Option<u64>,

    /// Per-probe timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_timeout_secs: Option<u64>,

    /// Grace period between SIGTERM and a forced kill
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_grace_secs: Option<u64>,

    /// Number of conversation entries replayed on restart
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_replay: Option<usize>,

    /// Number of output lines included in completion reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<usize>,

    /// Extra text appended to the manager system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_additions: Option<String>,
}

/// One LLM endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,

    /// Relative share of traffic
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Concurrent request cap, `None` means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,

    /// Literal API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model override for this endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_weight() -> u32 {
    1
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            weight: 1,
            max_concurrent: None,
            api_key: None,
            api_key_env: None,
            model: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Resolve the API key, preferring the literal value over the env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|v| !v.is_empty())
        })
    }
}

/// Worker subprocess command and arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for WorkerCommandConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
        }
    }
}

/// Fully resolved configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub model: String,
    pub max_workers: usize,
    pub max_iterations: usize,
    pub yolo: bool,
    pub base_branch: String,
    pub issues_dir: PathBuf,
    pub specs_dir: PathBuf,
    pub worktree_root: PathBuf,
    pub worker: WorkerCommandConfig,
    pub test_command: Option<String>,
    pub health_check_interval: Duration,
    pub health_timeout: Duration,
    pub kill_grace: Duration,
    pub history_replay: usize,
    pub tail_lines: usize,
    pub system_prompt_additions: Option<String>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            model: DEFAULT_MODEL.to_string(),
            max_workers: 3,
            max_iterations: 50,
            yolo: false,
            base_branch: "main".to_string(),
            issues_dir: PathBuf::from(".conductor/issues"),
            specs_dir: PathBuf::from("specs"),
            worktree_root: PathBuf::from(".conductor/worktrees"),
            worker: WorkerCommandConfig::default(),
            test_command: None,
            health_check_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(10),
            history_replay: 50,
            tail_lines: 30,
            system_prompt_additions: None,
        }
    }
}

impl ResolvedConfig {
    /// Make relative directories absolute against the workspace root.
    pub fn anchor(mut self, root: &std::path::Path) -> Self {
        for dir in [&mut self.issues_dir, &mut self.specs_dir, &mut self.worktree_root] {
            if dir.is_relative() {
                *dir = root.join(&*dir);
            }
        }
        self
    }
}
