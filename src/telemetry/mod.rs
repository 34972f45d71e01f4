// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structured logging.
//!
//! Everything logs through `tracing` with structured fields:
//!
//! ```rust,ignore
//! info!(issue_id, endpoint = %slot.endpoint_name(), "Worker launched");
//! ```
//!
//! `RUST_LOG` overrides the level chosen from the CLI flags. The
//! `release-logs` and `max-perf` features strip levels at compile time.

mod init;

pub use init::{init_telemetry, TelemetryConfig};
