// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for Conductor.
//!
//! Handles loading and merging configuration from multiple sources:
//! - Global config: ~/.conductor/config.json
//! - Workspace config: .conductor.json, .conductor/config.json, or conductor.yaml
//! - Local config: .conductor.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_example_config, get_global_config_path, init_config,
    load_config_file, load_global_config, load_local_config, load_workspace_config, CONFIG_FILES,
    LOCAL_CONFIG_FILE,
};

pub use merger::{endpoint_from_env, merge_config, CliOptions};

pub use types::{
    EndpointConfig, ResolvedConfig, WorkerCommandConfig, WorkspaceConfig, DEFAULT_BASE_URL,
    DEFAULT_MODEL,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
///
/// An explicit `config_path` replaces the workspace file search. Relative
/// directories are anchored at `workspace_root`, and the environment
/// fallback endpoint is added when no endpoints are configured.
pub fn load_config(
    workspace_root: &Path,
    config_path: Option<&Path>,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = match config_path {
        Some(path) => Some(load_config_file(path)?),
        None => load_workspace_config(workspace_root)?,
    };
    let local = load_local_config(workspace_root)?;

    let mut config = merge_config(global, workspace, local, cli_options).anchor(workspace_root);
    if config.endpoints.is_empty() {
        config.endpoints.extend(endpoint_from_env());
    }
    validate(&config)?;
    Ok(config)
}

/// Reject configurations the router cannot work with.
pub fn validate(config: &ResolvedConfig) -> Result<(), ConfigError> {
    for endpoint in &config.endpoints {
        if endpoint.weight == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("endpoints.{}.weight", endpoint.name),
                message: "weight must be at least 1".to_string(),
            });
        }
        if endpoint.max_concurrent == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: format!("endpoints.{}.maxConcurrent", endpoint.name),
                message: "maxConcurrent must be at least 1".to_string(),
            });
        }
    }
    let mut names: Vec<&str> = config.endpoints.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(ConfigError::InvalidValue {
            field: "endpoints".to_string(),
            message: format!("duplicate endpoint name '{}'", dup[0]),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_workspace_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".conductor.json"),
            r#"{"endpoints": [{"name": "a", "url": "http://a"}], "maxIterations": 12}"#,
        )
        .unwrap();

        let config = load_config(temp.path(), None, CliOptions::default()).unwrap();
        assert_eq!(config.max_iterations, 12);
        assert_eq!(config.endpoints[0].name, "a");
        assert!(config.issues_dir.starts_with(temp.path()));
    }

    #[test]
    fn test_explicit_config_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.yaml");
        std::fs::write(&path, "endpoints:\n  - name: y\n    url: http://y\n").unwrap();

        let cli = CliOptions {
            model: Some("claude-opus-4-20250514".to_string()),
            ..Default::default()
        };
        let config = load_config(temp.path(), Some(&path), cli).unwrap();
        assert_eq!(config.endpoints[0].name, "y");
        assert_eq!(config.model, "claude-opus-4-20250514");
    }

    #[test]
    fn test_validate_rejects_zero_weight() {
        let mut config = ResolvedConfig::default();
        config.endpoints.push(EndpointConfig::new("a", "http://a").with_weight(0));
        assert!(matches!(validate(&config), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = ResolvedConfig::default();
        config.endpoints.push(EndpointConfig::new("a", "http://a"));
        config.endpoints.push(EndpointConfig::new("a", "http://b"));
        assert!(validate(&config).is_err());
    }
}
