// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker subprocess supervision.
//!
//! # Lifecycle
//!
//! 1. `start` spawns the command in the worktree and pipes the task context
//!    to stdin
//! 2. stdout and stderr are captured line by line for the life of the run
//! 3. on exit the outcome is classified and a [`WorkerEvent::Finished`] is
//!    sent on the events channel
//! 4. `kill` sends SIGTERM, waits the grace period, then force-kills

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::outcome::{classify_outcome, WorkerOutcome, RESULT_MARKER};
use crate::error::WorkerError;

/// How long to wait for output readers after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        match self {
            Self::Idle => next == Self::Running,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl From<&WorkerOutcome> for WorkerStatus {
    fn from(outcome: &WorkerOutcome) -> Self {
        match outcome {
            WorkerOutcome::Completed { .. } => Self::Completed,
            WorkerOutcome::Blocked { .. } => Self::Blocked,
            WorkerOutcome::Failed { .. } => Self::Failed,
        }
    }
}

/// Notification from a worker to its owner.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Finished { issue_id: u32, outcome: WorkerOutcome },
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub issue_id: u32,
    pub command: String,
    pub args: Vec<String>,
    pub worktree: PathBuf,
    /// Written to the worker's stdin.
    pub context: String,
    pub endpoint_url: String,
    pub api_key: Option<String>,
    pub kill_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct WorkerState {
    status: WorkerStatus,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    finished_at: Option<Instant>,
    output: Vec<(Stream, String)>,
    exit_code: Option<i32>,
    outcome: Option<WorkerOutcome>,
    pid: Option<u32>,
}

impl WorkerState {
    fn transition(&mut self, next: WorkerStatus) -> Result<(), WorkerError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    fn joined(&self, stream: Stream) -> String {
        let mut out = String::new();
        for (s, line) in &self.output {
            if *s == stream {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    fn tail(&self, n: usize, stream: Option<Stream>) -> Vec<String> {
        let mut lines: Vec<String> = self
            .output
            .iter()
            .rev()
            .filter(|(s, _)| stream.map_or(true, |want| *s == want))
            .take(n)
            .map(|(_, line)| line.clone())
            .collect();
        lines.reverse();
        lines
    }
}

/// One supervised worker subprocess.
pub struct Worker {
    spec: WorkerSpec,
    /// Distinguishes repeated runs for the same issue.
    run_id: Uuid,
    state: Arc<Mutex<WorkerState>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: watch::Receiver<bool>,
    done_tx: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(spec: WorkerSpec) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            spec,
            run_id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(WorkerState {
                status: WorkerStatus::Idle,
                started_at: None,
                started_wall: None,
                finished_at: None,
                output: Vec::new(),
                exit_code: None,
                outcome: None,
                pid: None,
            })),
            kill_tx: Mutex::new(None),
            done_rx,
            done_tx: Arc::new(done_tx),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn issue_id(&self) -> u32 {
        self.spec.issue_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Spawn the subprocess. Only valid once, from `idle`.
    pub async fn start(&self, events: mpsc::UnboundedSender<WorkerEvent>) -> Result<(), WorkerError> {
        {
            let mut state = self.lock();
            state.transition(WorkerStatus::Running)?;
            state.started_at = Some(Instant::now());
            state.started_wall = Some(Utc::now());
        }

        // A marker left by an earlier run in a reused worktree is stale.
        let marker = self.spec.worktree.join(RESULT_MARKER);
        let _ = tokio::fs::remove_file(&marker).await;

        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .current_dir(&self.spec.worktree)
            .env("CONDUCTOR_ISSUE_ID", self.spec.issue_id.to_string())
            .env("CONDUCTOR_WORKTREE", &self.spec.worktree)
            .env("CONDUCTOR_RUN_ID", self.run_id.to_string())
            .env("ANTHROPIC_BASE_URL", &self.spec.endpoint_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref key) = self.spec.api_key {
            command.env("ANTHROPIC_API_KEY", key);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", self.spec.command, e);
                let mut state = self.lock();
                state.finished_at = Some(Instant::now());
                state.outcome = Some(WorkerOutcome::Failed {
                    exit_code: None,
                    diagnostic: message.clone(),
                });
                let _ = state.transition(WorkerStatus::Failed);
                drop(state);
                let _ = self.done_tx.send(true);
                return Err(WorkerError::SpawnFailed(message));
            }
        };

        let pid = child.id();
        self.lock().pid = pid;
        info!(issue_id = self.spec.issue_id, run_id = %self.run_id, pid, worktree = %self.spec.worktree.display(), "Worker started");

        if let Some(mut stdin) = child.stdin.take() {
            let context = self.spec.context.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(context.as_bytes()).await {
                    debug!(error = %e, "Worker closed stdin early");
                }
                // Dropping stdin closes the pipe.
            });
        }

        let readers = [
            child.stdout.take().map(|out| spawn_reader(out, Stream::Stdout, Arc::clone(&self.state))),
            child.stderr.take().map(|err| spawn_reader(err, Stream::Stderr, Arc::clone(&self.state))),
        ];

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(kill_tx);

        tokio::spawn(supervise(
            child,
            readers,
            kill_rx,
            self.spec.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.done_tx),
            events,
        ));
        Ok(())
    }

    /// Stop a running worker and wait until it has exited.
    pub async fn kill(&self) {
        let tx = self.kill_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        self.wait().await;
    }

    /// Wait for the worker to reach a terminal state.
    pub async fn wait(&self) {
        if self.lock().status == WorkerStatus::Idle {
            return;
        }
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn status(&self) -> WorkerStatus {
        self.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == WorkerStatus::Running
    }

    pub fn outcome(&self) -> Option<WorkerOutcome> {
        self.lock().outcome.clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_wall
    }

    /// Run time so far, or total run time once finished.
    pub fn elapsed(&self) -> Duration {
        let state = self.lock();
        match (state.started_at, state.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn stdout(&self) -> String {
        self.lock().joined(Stream::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.lock().joined(Stream::Stderr)
    }

    pub fn tail_stdout(&self, n: usize) -> Vec<String> {
        self.lock().tail(n, Some(Stream::Stdout))
    }

    pub fn tail_stderr(&self, n: usize) -> Vec<String> {
        self.lock().tail(n, Some(Stream::Stderr))
    }

    /// Last `n` lines across both streams in arrival order.
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.lock().tail(n, None)
    }
}

fn spawn_reader<R>(reader: R, stream: Stream, state: Arc<Mutex<WorkerState>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string();
                    state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .output
                        .push((stream, line));
                }
                Err(e) => {
                    debug!(error = %e, ?stream, "Worker output read failed");
                    break;
                }
            }
        }
    })
}

/// Owns the child until it exits, then records and reports the outcome.
async fn supervise(
    mut child: Child,
    readers: [Option<JoinHandle<()>>; 2],
    mut kill_rx: oneshot::Receiver<()>,
    spec: WorkerSpec,
    state: Arc<Mutex<WorkerState>>,
    done_tx: Arc<watch::Sender<bool>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let (exit_code, killed) = tokio::select! {
        status = child.wait() => (status.ok().and_then(|s| s.code()), false),
        _ = &mut kill_rx => (terminate(&mut child, spec.kill_grace).await, true),
    };

    for reader in readers.into_iter().flatten() {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            warn!(issue_id = spec.issue_id, "Worker output still open after exit");
        }
    }

    let marker = tokio::fs::read_to_string(spec.worktree.join(RESULT_MARKER)).await.ok();

    let outcome = {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = if killed {
            WorkerOutcome::Failed {
                exit_code,
                diagnostic: "worker was stopped".to_string(),
            }
        } else {
            classify_outcome(
                &state.joined(Stream::Stdout),
                &state.joined(Stream::Stderr),
                marker.as_deref(),
                exit_code,
            )
        };
        state.exit_code = exit_code;
        state.finished_at = Some(Instant::now());
        state.outcome = Some(outcome.clone());
        if let Err(e) = state.transition(WorkerStatus::from(&outcome)) {
            warn!(issue_id = spec.issue_id, error = %e, "Unexpected worker transition");
        }
        outcome
    };

    info!(issue_id = spec.issue_id, exit_code, outcome = outcome.label(), "Worker finished");
    let _ = done_tx.send(true);
    let _ = events.send(WorkerEvent::Finished {
        issue_id: spec.issue_id,
        outcome,
    });
}

/// SIGTERM, then SIGKILL once the grace period runs out.
async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not yet reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status.ok().and_then(|s| s.code());
            }
            warn!(pid, "Worker ignored SIGTERM, killing");
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill worker");
    }
    child.try_wait().ok().flatten().and_then(|s| s.code())
}
