// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;
use std::time::Duration;

use super::types::{EndpointConfig, ResolvedConfig, WorkspaceConfig, DEFAULT_BASE_URL};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub model: Option<String>,
    pub max_workers: Option<usize>,
    pub yolo: Option<bool>,
    pub base_branch: Option<String>,
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.conductor.local.json)
/// 3. Workspace config
/// 4. Global config (~/.conductor/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = ResolvedConfig::default();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    // Endpoint lists replace rather than extend; a workspace pool is a complete pool.
    if let Some(ref endpoints) = config.endpoints {
        result.endpoints = endpoints.clone();
    }
    if let Some(ref model) = config.model {
        result.model = model.clone();
    }
    if let Some(max_workers) = config.max_workers {
        result.max_workers = max_workers.max(1);
    }
    if let Some(max_iterations) = config.max_iterations {
        result.max_iterations = max_iterations;
    }
    if let Some(yolo) = config.yolo {
        result.yolo = yolo;
    }
    if let Some(ref branch) = config.base_branch {
        result.base_branch = branch.clone();
    }
    if let Some(ref dir) = config.issues_dir {
        result.issues_dir = PathBuf::from(dir);
    }
    if let Some(ref dir) = config.specs_dir {
        result.specs_dir = PathBuf::from(dir);
    }
    if let Some(ref dir) = config.worktree_root {
        result.worktree_root = PathBuf::from(dir);
    }
    if let Some(ref worker) = config.worker {
        result.worker = worker.clone();
    }
    if config.test_command.is_some() {
        result.test_command = config.test_command.clone();
    }
    if let Some(secs) = config.health_check_interval_secs {
        result.health_check_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(secs) = config.health_timeout_secs {
        result.health_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = config.kill_grace_secs {
        result.kill_grace = Duration::from_secs(secs);
    }
    if let Some(n) = config.history_replay {
        result.history_replay = n;
    }
    if let Some(n) = config.tail_lines {
        result.tail_lines = n;
    }
    if config.system_prompt_additions.is_some() {
        result.system_prompt_additions = config.system_prompt_additions.clone();
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref model) = cli.model {
        result.model = model.clone();
    }
    if let Some(max_workers) = cli.max_workers {
        result.max_workers = max_workers.max(1);
    }
    if let Some(yolo) = cli.yolo {
        result.yolo = yolo;
    }
    if let Some(ref branch) = cli.base_branch {
        result.base_branch = branch.clone();
    }
}

/// Build a single endpoint from `ANTHROPIC_API_KEY` / `ANTHROPIC_BASE_URL`.
///
/// Used only when no endpoints are configured.
pub fn endpoint_from_env() -> Option<EndpointConfig> {
    let key = std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty());
    let url = std::env::var("ANTHROPIC_BASE_URL").ok().filter(|u| !u.is_empty());
    if key.is_none() && url.is_none() {
        return None;
    }
    let mut endpoint = EndpointConfig::new("default", url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()));
    endpoint.api_key = key;
    Some(endpoint)
}
