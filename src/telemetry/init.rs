// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup.

use std::io;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How logging is initialised.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level for this crate when RUST_LOG is not set.
    pub default_level: Level,

    /// Level for dependencies when RUST_LOG is not set.
    pub dependency_level: Level,

    /// Whether to include file/line information.
    pub include_file_line: bool,

    /// Whether to include target module path.
    pub include_target: bool,

    pub ansi_colors: bool,

    /// Custom filter directive. Takes precedence over RUST_LOG.
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        // The REPL owns stdout; only problems are logged by default.
        Self {
            default_level: Level::WARN,
            dependency_level: Level::WARN,
            include_file_line: false,
            include_target: false,
            ansi_colors: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Config for the `--verbose` and `--debug` flags.
    pub fn from_flags(verbose: bool, debug: bool) -> Self {
        let mut config = Self::default();
        if debug {
            config.default_level = Level::DEBUG;
            config.dependency_level = Level::INFO;
            config.include_file_line = true;
            config.include_target = true;
        } else if verbose {
            config.default_level = Level::INFO;
        }
        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    /// Filter used when neither a directive nor RUST_LOG is given.
    pub fn default_directive(&self) -> String {
        format!(
            "{},conductor={}",
            self.dependency_level.as_str().to_lowercase(),
            self.default_level.as_str().to_lowercase()
        )
    }
}

/// Install the global subscriber. Logs go to stderr.
///
/// Call once at startup. A second call fails.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<()> {
    let fallback = || EnvFilter::new(config.default_directive());
    let filter = match &config.filter_directive {
        Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_quiet() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_level, Level::WARN);
        assert_eq!(config.default_directive(), "warn,conductor=warn");
    }

    #[test]
    fn test_flags_raise_level() {
        assert_eq!(TelemetryConfig::from_flags(true, false).default_level, Level::INFO);

        let debug = TelemetryConfig::from_flags(true, true);
        assert_eq!(debug.default_level, Level::DEBUG);
        assert!(debug.include_file_line);
        assert_eq!(debug.default_directive(), "info,conductor=debug");
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::default()
            .with_level(Level::TRACE)
            .with_filter("conductor::router=trace")
            .with_ansi(false);
        assert_eq!(config.default_level, Level::TRACE);
        assert_eq!(config.filter_directive.as_deref(), Some("conductor::router=trace"));
        assert!(!config.ansi_colors);
    }
}
