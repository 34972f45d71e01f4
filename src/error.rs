// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for Conductor.
//!
//! Each component gets its own strongly-typed error built with `thiserror`.
//! `anyhow` is used only at the binary boundary.

use thiserror::Error;

use crate::issues::IssueStatus;

/// Errors that can occur while talking to an LLM backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("API error: {message}")]
    ApiError {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Response parsing error: {0}")]
    ParseError(String),

    #[error("Streaming error: {0}")]
    StreamError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl ProviderError {
    /// Create an API error with status code.
    pub fn api(message: impl Into<String>, status_code: u16) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::NetworkError(_) | Self::Timeout(_)
        )
    }
}

/// Errors produced by the endpoint router.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("No endpoints available")]
    NoEndpointsAvailable,

    #[error("No endpoints configured")]
    NoEndpointsConfigured,

    #[error("Endpoint '{endpoint}' failed: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: ProviderError,
    },

    #[error("Request was dropped before an endpoint became available")]
    QueueClosed,
}

/// Errors produced by the issue store and state machine.
#[derive(Error, Debug)]
pub enum IssueError {
    #[error("Issue #{0} not found")]
    NotFound(u32),

    #[error("Illegal status transition for issue #{id}: {from} -> {to}")]
    InvalidTransition {
        id: u32,
        from: IssueStatus,
        to: IssueStatus,
    },

    #[error("Invalid issue record {path}: {message}")]
    InvalidRecord { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors produced by the VCS coordinator.
#[derive(Error, Debug)]
pub enum VcsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Worktree creation failed: {0}")]
    WorktreeCreationFailed(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),
}

/// Errors produced by the worker supervisor.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Illegal worker transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors that can occur while persisting the conversation log.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that abort a manager turn.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Maximum iterations exceeded: {0}")]
    MaxIterationsExceeded(usize),

    #[error("Repeated tool call: the same tool batch was requested {count} times in a row ({tools})")]
    RepeatedToolCall { count: usize, tools: String },

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Issue store error: {0}")]
    Issues(#[from] IssueError),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("Orchestrator has shut down")]
    ShutDown,
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::RateLimited("wait 1s".to_string()).is_retryable());
        assert!(ProviderError::NetworkError("timeout".to_string()).is_retryable());
        assert!(ProviderError::Timeout(30000).is_retryable());
        assert!(!ProviderError::AuthError("invalid key".to_string()).is_retryable());
    }

    #[test]
    fn test_router_error_wraps_endpoint_name() {
        let err = RouterError::Endpoint {
            endpoint: "primary".to_string(),
            source: ProviderError::api("overloaded", 529),
        };
        let display = err.to_string();
        assert!(display.contains("primary"));
        assert!(display.contains("overloaded"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = IssueError::InvalidTransition {
            id: 7,
            from: IssueStatus::Open,
            to: IssueStatus::Done,
        };
        assert_eq!(
            err.to_string(),
            "Illegal status transition for issue #7: open -> done"
        );
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let config_err: ConfigError = result.unwrap_err().into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_orchestrator_error_from_router() {
        let err: OrchestratorError = RouterError::NoEndpointsAvailable.into();
        assert!(matches!(err, OrchestratorError::Router(_)));
    }
}
