// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::{EndpointConfig, WorkerCommandConfig, WorkspaceConfig, DEFAULT_MODEL};

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[".conductor.json", ".conductor/config.json", "conductor.yaml"];

/// Local config file name (for per-directory overrides).
pub const LOCAL_CONFIG_FILE: &str = ".conductor.local.json";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".conductor";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR).join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.conductor/config.json.
pub fn load_global_config() -> Result<Option<WorkspaceConfig>, ConfigError> {
    match get_global_config_path() {
        Some(path) if path.exists() => load_config_file(&path).map(Some),
        _ => Ok(None),
    }
}

/// Load workspace configuration from the first config file that exists.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load local configuration from .conductor.local.json.
pub fn load_local_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = workspace_root.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a configuration file (JSON or YAML by extension).
pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Write an example config to `.conductor.json`, refusing to overwrite.
pub fn init_config(workspace_root: &Path) -> Result<PathBuf, ConfigError> {
    let path = workspace_root.join(CONFIG_FILES[0]);
    if path.exists() {
        return Err(ConfigError::InvalidValue {
            field: "path".to_string(),
            message: format!("{} already exists", path.display()),
        });
    }
    let content = serde_json::to_string_pretty(&get_example_config())?;
    std::fs::write(&path, content)?;
    Ok(path)
}

/// Find the workspace root by walking up until a config file or `.git` appears.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        if current.join(".git").exists()
            || CONFIG_FILES.iter().any(|f| current.join(f).exists())
        {
            return Some(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

/// Get an example configuration.
pub fn get_example_config() -> WorkspaceConfig {
    WorkspaceConfig {
        endpoints: Some(vec![
            EndpointConfig {
                api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
                ..EndpointConfig::new("anthropic", "https://api.anthropic.com").with_weight(3)
            },
            EndpointConfig::new("local-proxy", "http://localhost:8080")
                .with_weight(1)
                .with_max_concurrent(2),
        ]),
        model: Some(DEFAULT_MODEL.to_string()),
        max_workers: Some(3),
        base_branch: Some("main".to_string()),
        worker: Some(WorkerCommandConfig::default()),
        test_command: Some("cargo test".to_string()),
        ..Default::default()
    }
}
