// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The manager agent.
//!
//! The orchestrator runs the conversational tool-use loop against the
//! endpoint router, schedules worker subprocesses under a concurrency cap
//! and turns worker completions back into conversation turns.
//!
//! # Turn flow
//!
//! ```text
//! submit(msg) ──> turn queue ──> chat() ──> Router::complete ──> tools ──┐
//!                    ^                 ^                                 │
//!                    │                 └─────── tool results ────────────┘
//!                    │
//! WorkerEvent::Finished ──> release slot, update issue, drain queue ──> report turn
//! ```
//!
//! Turns run one at a time in submission order. Worker events are handled on
//! their own task so the queue drains even while a turn is in progress.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Arc::new(Orchestrator::new(options)?);
//! orchestrator.recover().await?;
//! tokio::spawn(Arc::clone(&orchestrator).run());
//! let reply = orchestrator.submit("Add a login page").await??;
//! ```

mod guard;
mod handlers;
mod prompt;
mod queue;
mod recovery;
mod scheduler;
mod types;

pub use guard::{batch_signature, RepeatGuard, REPEAT_LIMIT};
pub use prompt::{format_duration, system_prompt, worker_context, worker_report};
pub use queue::{QueuedWorker, WorkerQueue};
pub use recovery::{RecoveredIssue, RecoveryReport};
pub use types::{OrchestratorCallbacks, OrchestratorEvent, ToolConfirmation};

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::error::OrchestratorError;
use crate::issues::IssueStore;
use crate::router::Router;
use crate::session::ConversationLog;
use crate::tools::{definitions, ToolRequest, CANCELLED};
use crate::types::{CompletionRequest, ContentBlock, Message, Role, ToolCall};
use crate::vcs::VcsCoordinator;
use crate::worker::{Worker, WorkerEvent};

use scheduler::Scheduler;

/// Everything the orchestrator is built from.
pub struct OrchestratorOptions {
    pub config: ResolvedConfig,
    /// Repository root. Tools without an issue act here.
    pub repo_root: PathBuf,
    pub router: Arc<Router>,
    pub issues: Arc<dyn IssueStore>,
    pub vcs: Arc<dyn VcsCoordinator>,
    pub log: ConversationLog,
    pub callbacks: OrchestratorCallbacks,
}

/// Reply to a submitted turn.
pub type TurnReply = oneshot::Receiver<Result<String, OrchestratorError>>;

struct Turn {
    message: String,
    reply: Option<oneshot::Sender<Result<String, OrchestratorError>>>,
}

struct Conversation {
    messages: Vec<Message>,
    /// Prepended to the next user message, e.g. a recovery summary.
    pending_context: Option<String>,
}

/// The manager agent.
pub struct Orchestrator {
    config: ResolvedConfig,
    repo_root: PathBuf,
    router: Arc<Router>,
    issues: Arc<dyn IssueStore>,
    vcs: Arc<dyn VcsCoordinator>,
    log: ConversationLog,
    callbacks: OrchestratorCallbacks,
    system_prompt: String,
    conversation: Mutex<Conversation>,
    scheduler: Mutex<Scheduler>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_rx: StdMutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    turn_tx: mpsc::UnboundedSender<Turn>,
    turn_rx: StdMutex<Option<mpsc::UnboundedReceiver<Turn>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create an orchestrator, replaying the tail of the persisted conversation.
    pub fn new(options: OrchestratorOptions) -> Result<Self, OrchestratorError> {
        let messages = options.log.replay(options.config.history_replay)?;
        if !messages.is_empty() {
            info!(messages = messages.len(), "Replayed conversation history");
        }

        let system_prompt = prompt::system_prompt(
            &options.config.base_branch,
            options.config.max_workers,
            options.config.system_prompt_additions.as_deref(),
        );
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config: options.config,
            repo_root: options.repo_root,
            router: options.router,
            issues: options.issues,
            vcs: options.vcs,
            log: options.log,
            callbacks: options.callbacks,
            system_prompt,
            conversation: Mutex::new(Conversation {
                messages,
                pending_context: None,
            }),
            scheduler: Mutex::new(Scheduler::default()),
            worker_tx,
            worker_rx: StdMutex::new(Some(worker_rx)),
            turn_tx,
            turn_rx: StdMutex::new(Some(turn_rx)),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn issues(&self) -> &Arc<dyn IssueStore> {
        &self.issues
    }

    /// Queue a user message. Turns run in submission order once [`run`](Self::run) is active.
    pub fn submit(&self, message: impl Into<String>) -> TurnReply {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Turn {
            message: message.into(),
            reply: Some(tx),
        });
        rx
    }

    fn enqueue(&self, turn: Turn) {
        if let Err(mpsc::error::SendError(turn)) = self.turn_tx.send(turn) {
            if let Some(reply) = turn.reply {
                let _ = reply.send(Err(OrchestratorError::ShutDown));
            }
        }
    }

    /// Process queued turns and worker events until shutdown.
    pub async fn run(self: Arc<Self>) {
        let turns = self.turn_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut turns) = turns else {
            warn!("Orchestrator is already running");
            return;
        };
        let worker_rx = self.worker_rx.lock().unwrap_or_else(|e| e.into_inner()).take();

        let events_task = worker_rx.map(|mut rx| {
            let this = Arc::clone(&self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut capacity = self.router.subscribe_capacity();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => this.handle_worker_event(event).await,
                            None => break,
                        },
                        changed = capacity.changed() => match changed {
                            Ok(()) => this.retry_queue().await,
                            Err(_) => break,
                        },
                        _ = stopped(&mut shutdown) => break,
                    }
                }
            })
        });

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let turn = tokio::select! {
                turn = turns.recv() => turn,
                _ = stopped(&mut shutdown) => None,
            };
            let Some(turn) = turn else {
                break;
            };

            let result = self.chat(&turn.message).await;
            match turn.reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        warn!(error = %e, "Report turn failed");
                        self.emit(OrchestratorEvent::TurnFailed { error: e.to_string() });
                    }
                }
            }
        }

        while let Ok(turn) = turns.try_recv() {
            if let Some(reply) = turn.reply {
                let _ = reply.send(Err(OrchestratorError::ShutDown));
            }
        }
        if let Some(task) = events_task {
            task.abort();
        }
        debug!("Orchestrator stopped");
    }

    /// Run one manager turn to completion.
    ///
    /// Returns the text of the final reply. Loop guards and router failures
    /// abort the turn, leaving everything already appended in place.
    pub async fn chat(&self, user_message: &str) -> Result<String, OrchestratorError> {
        if *self.shutdown_tx.borrow() {
            return Err(OrchestratorError::ShutDown);
        }
        let mut conversation = self.conversation.lock().await;

        let content = match conversation.pending_context.take() {
            Some(context) => format!("{}\n\n{}", context, user_message),
            None => user_message.to_string(),
        };
        self.record(&mut conversation, Message::user(content))?;

        let tools = definitions();
        let mut guard = RepeatGuard::new();
        let mut final_text = String::new();
        let mut iteration = 0usize;

        loop {
            iteration += 1;
            if !self.config.yolo && iteration > self.config.max_iterations {
                warn!(max = self.config.max_iterations, "Turn hit the iteration cap");
                return Err(OrchestratorError::MaxIterationsExceeded(self.config.max_iterations));
            }

            let request = CompletionRequest::new(conversation.messages.clone())
                .with_system(self.system_prompt.clone())
                .with_tools(tools.clone())
                .with_model(self.config.model.clone());
            let response = self.router.complete(&request).await?;

            if response.content.is_empty() {
                debug!(iteration, "Empty reply, ending turn");
                break;
            }
            self.record(
                &mut conversation,
                Message::with_blocks(Role::Assistant, response.content.clone()),
            )?;

            let segments = response.text_segments();
            if !segments.is_empty() {
                if let Some(ref on_text) = self.callbacks.on_text {
                    segments.iter().for_each(|s| on_text(s));
                }
                final_text = segments.join("\n");
            }

            let calls = response.tool_uses();
            if calls.is_empty() {
                break;
            }

            let repeats = guard.observe(&calls);
            if guard.exceeded() {
                let tools = calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ");
                warn!(tools = %tools, "Repeated tool batch, aborting turn");
                let skipped = calls
                    .iter()
                    .map(|c| ContentBlock::tool_result(&c.id, "Not executed: identical tool calls repeated.", true))
                    .collect();
                self.record(&mut conversation, Message::with_blocks(Role::User, skipped))?;
                return Err(OrchestratorError::RepeatedToolCall {
                    count: repeats,
                    tools,
                });
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let (content, is_error) = self.execute_tool(call).await;
                results.push(ContentBlock::tool_result(&call.id, content, is_error));
            }
            self.record(&mut conversation, Message::with_blocks(Role::User, results))?;
        }

        debug!(iterations = iteration, "Turn complete");
        Ok(final_text)
    }

    fn record(&self, conversation: &mut Conversation, message: Message) -> Result<(), OrchestratorError> {
        self.log.append(&message)?;
        conversation.messages.push(message);
        Ok(())
    }

    /// Parse, gate and run one tool call. Never fails.
    async fn execute_tool(&self, call: &ToolCall) -> (String, bool) {
        if let Some(ref on_tool_call) = self.callbacks.on_tool_call {
            on_tool_call(&call.name, &call.input);
        }

        let (content, is_error) = match ToolRequest::parse(call) {
            Err(message) => (message, true),
            Ok(request) => {
                if request.is_destructive() && !self.approve(&request, call) {
                    info!(tool = %call.name, "Tool call declined");
                    (CANCELLED.to_string(), false)
                } else {
                    (self.dispatch(request).await, false)
                }
            }
        };
        debug!(tool = %call.name, is_error, bytes = content.len(), "Tool executed");

        if let Some(ref on_tool_result) = self.callbacks.on_tool_result {
            on_tool_result(&call.name, &content, is_error);
        }
        (content, is_error)
    }

    fn approve(&self, request: &ToolRequest, call: &ToolCall) -> bool {
        if self.config.yolo {
            return true;
        }
        let Some(ref on_confirm) = self.callbacks.on_confirm else {
            warn!(tool = request.name(), "No approval handler, refusing destructive tool");
            return false;
        };
        on_confirm(&ToolConfirmation {
            tool_name: request.name().to_string(),
            description: request.describe(),
            input: call.input.clone(),
        })
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(ref on_event) = self.callbacks.on_event {
            on_event(&event);
        }
    }

    /// Snapshot of the conversation.
    pub async fn messages(&self) -> Vec<Message> {
        self.conversation.lock().await.messages.clone()
    }

    /// Issue ids with a live worker, ascending.
    pub async fn running_workers(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.scheduler.lock().await.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The worker queue in drain order.
    pub async fn queued_workers(&self) -> Vec<QueuedWorker> {
        self.scheduler.lock().await.queue.iter().cloned().collect()
    }

    pub async fn worker(&self, issue_id: u32) -> Option<Arc<Worker>> {
        self.scheduler
            .lock()
            .await
            .workers
            .get(&issue_id)
            .map(|active| Arc::clone(&active.worker))
    }

    /// Stop everything: turns, live workers and health checks.
    ///
    /// Workers get SIGTERM and then SIGKILL after the grace period. Their
    /// issues stay `in_progress` so the next start recovers them.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let active: Vec<_> = {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.queue = WorkerQueue::new();
            scheduler.workers.drain().map(|(_, active)| active).collect()
        };
        if !active.is_empty() {
            info!(workers = active.len(), "Stopping workers");
        }

        let mut kills = JoinSet::new();
        for active in &active {
            let worker = Arc::clone(&active.worker);
            kills.spawn(async move { worker.kill().await });
        }
        while kills.join_next().await.is_some() {}

        for active in active {
            self.router.release_worker_slot(active.slot);
        }
        self.router.stop_health_checks();
    }
}

/// Resolves once shutdown has been requested.
///
/// The `watch::Ref` from `wait_for` is dropped here, so callers stay `Send`.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
