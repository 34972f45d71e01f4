// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Classifying how a worker run ended.
//!
//! Workers report through their output: a completion sentinel, a blocked
//! line with a reason, or nothing at all, in which case the exit code
//! decides. Output is often a stream of JSON events, so signals are looked
//! for both in raw lines and inside decoded JSON strings.

use serde::Serialize;
use serde_json::Value;

/// Printed by a worker that finished its task.
pub const COMPLETION_SENTINEL: &str = "WORKER_TASK_COMPLETE";

/// Prefix of the line a blocked worker prints, followed by the reason.
pub const BLOCKED_PREFIX: &str = "WORKER_BLOCKED:";

/// Marker file, relative to the worktree, a worker may write instead.
pub const RESULT_MARKER: &str = ".conductor/result";

/// Lines of raw output used when no structured diagnostic is found.
const DIAGNOSTIC_LINES: usize = 5;

/// Terminal result of a worker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// `confirmed` is false when only a zero exit code vouches for it.
    Completed { confirmed: bool },
    Blocked { reason: String },
    Failed {
        exit_code: Option<i32>,
        diagnostic: String,
    },
}

impl WorkerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
        }
    }

    /// One-line description for logs and reports.
    pub fn summary(&self) -> String {
        match self {
            Self::Completed { confirmed: true } => "completed".to_string(),
            Self::Completed { confirmed: false } => {
                "completed (exit code 0, no completion signal)".to_string()
            }
            Self::Blocked { reason } => format!("blocked: {}", reason),
            Self::Failed { exit_code, diagnostic } => match exit_code {
                Some(code) => format!("failed (exit code {}): {}", code, diagnostic),
                None => format!("failed: {}", diagnostic),
            },
        }
    }
}

/// Decide the outcome of a finished worker.
///
/// In order: the completion sentinel anywhere in the output, or a marker
/// file that is not itself a blocked report, means completed; a blocked
/// line means blocked with its reason; exit code 0 means completed without
/// confirmation; anything else failed.
pub fn classify_outcome(
    stdout: &str,
    stderr: &str,
    marker: Option<&str>,
    exit_code: Option<i32>,
) -> WorkerOutcome {
    let marker_reason = marker.and_then(blocked_reason);

    if stdout.contains(COMPLETION_SENTINEL)
        || stderr.contains(COMPLETION_SENTINEL)
        || (marker.is_some() && marker_reason.is_none())
    {
        return WorkerOutcome::Completed { confirmed: true };
    }

    if let Some(reason) = blocked_reason(stdout)
        .or_else(|| blocked_reason(stderr))
        .or(marker_reason)
    {
        return WorkerOutcome::Blocked { reason };
    }

    if exit_code == Some(0) {
        return WorkerOutcome::Completed { confirmed: false };
    }

    WorkerOutcome::Failed {
        exit_code,
        diagnostic: diagnose(stdout, stderr, exit_code),
    }
}

/// Reason from the last blocked line in `output`.
pub fn blocked_reason(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        if !line.contains(BLOCKED_PREFIX) {
            return None;
        }
        if let Ok(json) = serde_json::from_str::<Value>(line) {
            let mut found = None;
            visit_strings(&json, &mut |s| {
                if found.is_none() {
                    found = reason_after_prefix(s);
                }
            });
            if found.is_some() {
                return found;
            }
        }
        reason_after_prefix(line)
    })
}

fn reason_after_prefix(text: &str) -> Option<String> {
    let start = text.rfind(BLOCKED_PREFIX)? + BLOCKED_PREFIX.len();
    let rest = &text[start..];
    let reason = rest.lines().next().unwrap_or("").trim();
    if reason.is_empty() {
        Some("no reason given".to_string())
    } else {
        Some(reason.to_string())
    }
}

fn visit_strings(value: &Value, f: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}

/// Best-effort failure description.
fn diagnose(stdout: &str, stderr: &str, exit_code: Option<i32>) -> String {
    if let Some(message) = stdout.lines().rev().find_map(json_error) {
        return message;
    }
    for stream in [stderr, stdout] {
        let lines: Vec<&str> = stream.lines().filter(|l| !l.trim().is_empty()).collect();
        if !lines.is_empty() {
            let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
            return lines[start..].join("\n");
        }
    }
    match exit_code {
        Some(code) => format!("exited with code {} and no output", code),
        None => "terminated by a signal with no output".to_string(),
    }
}

/// Error text carried by one JSON output line, if any.
fn json_error(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let json: Value = serde_json::from_str(trimmed).ok()?;

    match json.get("error") {
        Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
        Some(Value::Object(obj)) => {
            if let Some(Value::String(s)) = obj.get("message") {
                return Some(s.clone());
            }
        }
        _ => {}
    }
    if json.get("is_error").and_then(Value::as_bool) == Some(true) {
        if let Some(Value::String(s)) = json.get("result") {
            return Some(s.clone());
        }
    }
    match json.get("message") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_wins_over_exit_code() {
        let outcome = classify_outcome("working\nWORKER_TASK_COMPLETE\n", "", None, Some(1));
        assert_eq!(outcome, WorkerOutcome::Completed { confirmed: true });
    }

    #[test]
    fn test_sentinel_inside_json_event() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"All done.\nWORKER_TASK_COMPLETE"}]}}"#;
        assert_eq!(
            classify_outcome(line, "", None, Some(0)),
            WorkerOutcome::Completed { confirmed: true }
        );
    }

    #[test]
    fn test_marker_file_completes() {
        assert_eq!(
            classify_outcome("", "", Some("done"), Some(2)),
            WorkerOutcome::Completed { confirmed: true }
        );
    }

    #[test]
    fn test_blocked_reason_verbatim() {
        let outcome = classify_outcome(
            "thinking\nWORKER_BLOCKED: need DB credentials for staging\n",
            "",
            None,
            Some(0),
        );
        assert_eq!(
            outcome,
            WorkerOutcome::Blocked {
                reason: "need DB credentials for staging".to_string()
            }
        );
    }

    #[test]
    fn test_blocked_reason_from_json_string() {
        let line = r#"{"type":"result","result":"Stopping.\nWORKER_BLOCKED: spec contradicts itself\nbye"}"#;
        assert_eq!(blocked_reason(line).as_deref(), Some("spec contradicts itself"));
    }

    #[test]
    fn test_blocked_marker_file() {
        assert_eq!(
            classify_outcome("", "", Some("WORKER_BLOCKED: waiting on #3"), Some(0)),
            WorkerOutcome::Blocked {
                reason: "waiting on #3".to_string()
            }
        );
    }

    #[test]
    fn test_clean_exit_is_unconfirmed_completion() {
        assert_eq!(
            classify_outcome("did stuff", "", None, Some(0)),
            WorkerOutcome::Completed { confirmed: false }
        );
    }

    #[test]
    fn test_failure_uses_json_error() {
        let stdout = "{\"type\":\"system\"}\n{\"type\":\"result\",\"is_error\":true,\"result\":\"API quota exceeded\"}\n";
        match classify_outcome(stdout, "noise", None, Some(1)) {
            WorkerOutcome::Failed { exit_code, diagnostic } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(diagnostic, "API quota exceeded");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_error_object() {
        let stdout = r#"{"error":{"type":"overloaded","message":"Overloaded"}}"#;
        match classify_outcome(stdout, "", None, Some(1)) {
            WorkerOutcome::Failed { diagnostic, .. } => assert_eq!(diagnostic, "Overloaded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_falls_back_to_stderr_tail() {
        let stderr = (1..=8).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        match classify_outcome("plain text", &stderr, None, Some(3)) {
            WorkerOutcome::Failed { diagnostic, .. } => {
                assert_eq!(diagnostic, "line 4\nline 5\nline 6\nline 7\nline 8");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_without_output() {
        match classify_outcome("", "", None, None) {
            WorkerOutcome::Failed { exit_code: None, diagnostic } => {
                assert!(diagnostic.contains("signal"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            WorkerOutcome::Blocked { reason: "x".into() }.summary(),
            "blocked: x"
        );
        assert_eq!(WorkerOutcome::Completed { confirmed: true }.label(), "completed");
    }
}
