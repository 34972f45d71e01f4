// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conductor - a manager agent for a team of coding agents.
//!
//! One long-lived manager model plans work as issues and hands each issue
//! to an autonomous worker subprocess running in its own git worktree. All
//! LLM traffic goes through a weighted, health-aware pool of endpoints.
//!
//! # Architecture
//!
//! - [`types`] - Messages, tool definitions and the [`Provider`] trait
//! - [`error`] - Error enums per component
//! - [`config`] - Configuration loading and merging
//! - [`providers`] - Anthropic Messages API client
//! - [`router`] - Weighted round robin endpoint pool with health checks
//! - [`issues`] - Issue records, the status state machine, storage, conflicts
//! - [`vcs`] - Worktree and branch management
//! - [`worker`] - Worker subprocess supervision and outcome classification
//! - [`session`] - Persistent conversation log
//! - [`tools`] - The manager's tool catalog
//! - [`orchestrator`] - The manager loop and worker scheduler
//! - [`telemetry`] - Logging setup
//!
//! # Example
//!
//! ```rust,ignore
//! use conductor::config::{load_config, CliOptions};
//! use conductor::router::Router;
//!
//! let config = load_config(&root, None, CliOptions::default())?;
//! let router = Arc::new(Router::from_config(&config)?);
//! router.start_health_checks(config.health_check_interval).await;
//! ```

pub mod config;
pub mod error;
pub mod issues;
pub mod orchestrator;
pub mod providers;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod tools;
pub mod types;
pub mod vcs;
pub mod worker;

pub use error::{
    ConfigError, IssueError, OrchestratorError, ProviderError, Result, RouterError, SessionError,
    VcsError, WorkerError,
};
pub use orchestrator::{Orchestrator, OrchestratorCallbacks, OrchestratorEvent, OrchestratorOptions};
pub use router::Router;
pub use types::{
    CompletionRequest, ContentBlock, Message, MessageContent, Provider, ProviderResponse, Role,
    SharedProvider, StopReason, StreamEvent, ToolCall, ToolDefinition,
};

/// Conductor version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
