// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker scheduling: spawn, queue, drain and completion.
//!
//! All of it runs under the scheduler lock, so the running count and the
//! slot bindings change together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::prompt;
use super::queue::{QueuedWorker, WorkerQueue};
use super::{Orchestrator, OrchestratorEvent, Turn};
use crate::issues::{conflict_warning, find_conflicts, Issue, IssueStatus, IssueUpdate};
use crate::router::WorkerSlot;
use crate::worker::{Worker, WorkerEvent, WorkerOutcome, WorkerSpec};

/// Bytes of each spec file included in a worker's task context.
const SPEC_MAX_BYTES: usize = 20 * 1024;

/// A live worker and the resources bound to it.
pub(crate) struct ActiveWorker {
    pub worker: Arc<Worker>,
    pub slot: WorkerSlot,
    pub title: String,
    pub worktree: PathBuf,
    pub branch: String,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    pub workers: HashMap<u32, ActiveWorker>,
    pub queue: WorkerQueue,
}

/// Why a launch did not happen.
enum LaunchError {
    /// No endpoint can take another worker. Nothing was changed.
    NoCapacity,
    Failed(String),
}

impl Orchestrator {
    /// Start a worker for an issue, or queue it when all slots are busy.
    pub(crate) async fn spawn_worker(&self, issue_id: u32) -> String {
        let mut scheduler = self.scheduler.lock().await;

        if scheduler.workers.contains_key(&issue_id) {
            return format!("A worker for issue #{} is already running.", issue_id);
        }
        if let Some(position) = scheduler.queue.position(issue_id) {
            return format!("Issue #{} is already queued at position {}.", issue_id, position);
        }

        let issue = match self.issues.get(issue_id).await {
            Ok(Some(issue)) => issue,
            Ok(None) => return format!("Issue #{} not found.", issue_id),
            Err(e) => return format!("Failed to load issue #{}: {}", issue_id, e),
        };
        if !issue.status.is_spawnable() {
            return format!(
                "Issue #{} is {}. Only open or blocked issues can be started.",
                issue_id, issue.status
            );
        }

        if scheduler.workers.len() >= self.config.max_workers {
            let position = scheduler.queue.push(QueuedWorker::new(issue_id, issue.priority));
            info!(issue_id, position, "Worker queued");
            self.emit(OrchestratorEvent::WorkerQueued { issue_id, position });
            return format!(
                "All {} worker slots are busy. Issue #{} queued at position {} ({} priority).",
                self.config.max_workers, issue_id, position, issue.priority
            );
        }

        let priority = issue.priority;
        match self.launch(&mut scheduler, issue).await {
            Ok(message) => message,
            Err(LaunchError::NoCapacity) => {
                let position = scheduler.queue.push(QueuedWorker::new(issue_id, priority));
                info!(issue_id, position, "No endpoint capacity, worker queued");
                self.emit(OrchestratorEvent::WorkerQueued { issue_id, position });
                format!(
                    "No endpoint has capacity for another worker right now. Issue #{} queued at position {} \
                     and starts when an endpoint frees up.",
                    issue_id, position
                )
            }
            Err(LaunchError::Failed(message)) => message,
        }
    }

    async fn launch(&self, scheduler: &mut Scheduler, issue: Issue) -> Result<String, LaunchError> {
        let issue_id = issue.id;

        let mut running = Vec::with_capacity(scheduler.workers.len());
        for id in scheduler.workers.keys() {
            if let Ok(Some(other)) = self.issues.get(*id).await {
                running.push(other);
            }
        }
        let warning = conflict_warning(issue_id, &find_conflicts(&issue, &running));

        let slot = self.router.reserve_worker_slot().ok_or(LaunchError::NoCapacity)?;

        let worktree = match self
            .vcs
            .create_worktree(issue_id, &issue.slug, &self.config.base_branch)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.router.release_worker_slot(slot);
                return Err(LaunchError::Failed(format!(
                    "Failed to create a worktree for issue #{}: {}",
                    issue_id, e
                )));
            }
        };

        if let Err(e) = self.issues.update_status(issue_id, IssueStatus::InProgress).await {
            self.router.release_worker_slot(slot);
            return Err(LaunchError::Failed(format!(
                "Failed to start issue #{}: {}",
                issue_id, e
            )));
        }

        let specs = self.read_specs(&issue).await;
        let context = prompt::worker_context(&issue, &worktree.path, &worktree.branch, &specs);
        let worker = Arc::new(Worker::new(WorkerSpec {
            issue_id,
            command: self.config.worker.command.clone(),
            args: self.config.worker.args.clone(),
            worktree: worktree.path.clone(),
            context,
            endpoint_url: slot.url().to_string(),
            api_key: slot.api_key().map(str::to_string),
            kill_grace: self.config.kill_grace,
        }));

        if let Err(e) = worker.start(self.worker_tx.clone()).await {
            self.router.release_worker_slot(slot);
            if let Err(revert) = self.issues.update_status(issue_id, IssueStatus::Open).await {
                warn!(issue_id, error = %revert, "Failed to reopen issue after spawn failure");
            }
            return Err(LaunchError::Failed(format!(
                "Failed to start the worker for issue #{}: {}",
                issue_id, e
            )));
        }

        let endpoint = slot.endpoint_name().to_string();
        let log = format!(
            "Worker started on endpoint {} in branch {} (run {})",
            endpoint,
            worktree.branch,
            worker.run_id()
        );
        if let Err(e) = self.issues.update(issue_id, IssueUpdate::log(log)).await {
            warn!(issue_id, error = %e, "Failed to append to agent log");
        }

        info!(issue_id, endpoint = %endpoint, worktree = %worktree.path.display(), "Worker launched");
        scheduler.workers.insert(
            issue_id,
            ActiveWorker {
                worker,
                slot,
                title: issue.title.clone(),
                worktree: worktree.path.clone(),
                branch: worktree.branch.clone(),
            },
        );
        self.emit(OrchestratorEvent::WorkerStarted {
            issue_id,
            endpoint: endpoint.clone(),
        });

        let mut message = format!(
            "Started a worker for issue #{} \"{}\" on endpoint {} (branch {}).",
            issue_id, issue.title, endpoint, worktree.branch
        );
        if let Some(warning) = warning {
            message.push('\n');
            message.push_str(&warning);
        }
        Ok(message)
    }

    async fn read_specs(&self, issue: &Issue) -> Vec<(String, Option<String>)> {
        let mut specs = Vec::with_capacity(issue.specs.len());
        for path in &issue.specs {
            let content = tokio::fs::read_to_string(self.repo_root.join(path))
                .await
                .ok()
                .map(|text| crate::tools::truncate_text(&text, SPEC_MAX_BYTES));
            specs.push((path.clone(), content));
        }
        specs
    }

    /// Launch queued issues, highest priority first, while slots are free.
    pub(crate) async fn drain_queue(&self, scheduler: &mut Scheduler) -> Vec<u32> {
        let mut started = Vec::new();
        while scheduler.workers.len() < self.config.max_workers {
            let Some(entry) = scheduler.queue.pop() else {
                break;
            };

            let issue = match self.issues.get(entry.issue_id).await {
                Ok(Some(issue)) if issue.status.is_spawnable() => issue,
                Ok(Some(issue)) => {
                    info!(issue_id = issue.id, status = %issue.status, "Dropping queued issue that is no longer startable");
                    continue;
                }
                Ok(None) => {
                    debug!(issue_id = entry.issue_id, "Dropping queued issue that no longer exists");
                    continue;
                }
                Err(e) => {
                    warn!(issue_id = entry.issue_id, error = %e, "Failed to load queued issue");
                    continue;
                }
            };

            match self.launch(scheduler, issue).await {
                Ok(_) => started.push(entry.issue_id),
                Err(LaunchError::NoCapacity) => {
                    debug!(issue_id = entry.issue_id, "No endpoint capacity, leaving issue queued");
                    scheduler.queue.push_front(entry);
                    break;
                }
                Err(LaunchError::Failed(message)) => {
                    error!(issue_id = entry.issue_id, %message, "Queued launch failed");
                    self.enqueue(Turn {
                        message: prompt::launch_failure_report(entry.issue_id, &message),
                        reply: None,
                    });
                    self.emit(OrchestratorEvent::LaunchFailed {
                        issue_id: entry.issue_id,
                        error: message,
                    });
                }
            }
        }
        started
    }

    /// Retry the queue after endpoint capacity changed.
    pub(crate) async fn retry_queue(&self) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.queue.is_empty() {
            return;
        }
        let started = self.drain_queue(&mut scheduler).await;
        if !started.is_empty() {
            info!(?started, "Started queued workers after capacity freed");
        }
    }

    /// React to a finished worker.
    ///
    /// Workers already torn down by delete or shutdown are ignored.
    pub(crate) async fn handle_worker_event(&self, event: WorkerEvent) {
        let WorkerEvent::Finished { issue_id, outcome } = event;

        let mut scheduler = self.scheduler.lock().await;
        let Some(active) = scheduler.workers.remove(&issue_id) else {
            debug!(issue_id, "Event for a worker that is no longer tracked");
            return;
        };
        self.router.release_worker_slot(active.slot);

        let status = match outcome {
            WorkerOutcome::Completed { .. } => IssueStatus::Review,
            WorkerOutcome::Blocked { .. } => IssueStatus::Blocked,
            WorkerOutcome::Failed { .. } => IssueStatus::Open,
        };
        if let Err(e) = self.issues.update_status(issue_id, status).await {
            warn!(issue_id, error = %e, "Failed to update issue after worker finished");
        }
        if let Err(e) = self.issues.update(issue_id, IssueUpdate::log(format!("Worker {}", outcome.summary()))).await {
            warn!(issue_id, error = %e, "Failed to append to agent log");
        }

        info!(issue_id, outcome = outcome.label(), "Worker finished");
        self.emit(OrchestratorEvent::WorkerFinished {
            issue_id,
            outcome: outcome.clone(),
        });

        let started = self.drain_queue(&mut scheduler).await;
        if !started.is_empty() {
            info!(?started, "Started queued workers");
        }
        drop(scheduler);

        let tail = active.worker.tail(self.config.tail_lines);
        let report = prompt::worker_report(issue_id, &active.title, &outcome, active.worker.elapsed(), &tail);
        self.enqueue(Turn {
            message: report,
            reply: None,
        });
        self.emit(OrchestratorEvent::ReportQueued { issue_id });
    }
}
