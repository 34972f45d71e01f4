// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator behaviour against a scripted model, a directory-backed
//! worktree fake and real shell workers.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use conductor::config::{EndpointConfig, ResolvedConfig, WorkerCommandConfig};
use conductor::error::{OrchestratorError, ProviderError, VcsError};
use conductor::issues::{FileIssueStore, IssueStatus, IssueStore, NewIssue, Priority};
use conductor::orchestrator::{
    Orchestrator, OrchestratorCallbacks, OrchestratorEvent, OrchestratorOptions, ToolConfirmation,
};
use conductor::router::Router;
use conductor::session::ConversationLog;
use conductor::tools::CANCELLED;
use conductor::types::{
    CompletionRequest, ContentBlockType, Message, Provider, ProviderResponse, SharedProvider, StreamEvent,
    ToolCall,
};
use conductor::vcs::{branch_name, issue_id_from_dir_name, worktree_dir_name, MergeResult, VcsCoordinator};
use conductor::vcs::{WorktreeEntry, WorktreeInfo};

/// Sleeps until killed.
const LONG_WORKER: &str = "cat > /dev/null; exec sleep 30";

/// Completes once a `go` file appears in its worktree.
const GATED_WORKER: &str =
    "cat > /dev/null; while [ ! -f \"$CONDUCTOR_WORKTREE/go\" ]; do sleep 0.05; done; echo WORKER_TASK_COMPLETE";

// ============================================================================
// Fakes
// ============================================================================

/// Replies from a script, then plain "ok" once the script runs out.
struct ScriptedProvider {
    replies: Mutex<VecDeque<ProviderResponse>>,
    /// Text of the last plain user message of every request.
    seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
    healthy: AtomicBool,
}

impl ScriptedProvider {
    fn new(replies: Vec<ProviderResponse>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(text) = request.messages.iter().rev().find_map(Message::as_text) {
            self.seen.lock().unwrap().push(text.to_string());
        }
        let next = self.replies.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| ProviderResponse::text("ok")))
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _on_event: Box<dyn Fn(StreamEvent) + Send + Sync>,
    ) -> Result<ProviderResponse, ProviderError> {
        self.complete(request).await
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Worktrees as plain directories under one root.
struct DirVcs {
    root: PathBuf,
}

#[async_trait]
impl VcsCoordinator for DirVcs {
    async fn create_worktree(&self, issue_id: u32, slug: &str, _base: &str) -> Result<WorktreeInfo, VcsError> {
        let path = self.root.join(worktree_dir_name(issue_id, slug));
        std::fs::create_dir_all(&path)?;
        Ok(WorktreeInfo {
            path,
            branch: branch_name(issue_id, slug),
        })
    }

    async fn remove_worktree(&self, issue_id: u32, slug: &str) -> Result<(), VcsError> {
        std::fs::remove_dir_all(self.root.join(worktree_dir_name(issue_id, slug)))?;
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, VcsError> {
        let mut entries = Vec::new();
        for dir in std::fs::read_dir(&self.root)? {
            let dir = dir?;
            let name = dir.file_name().to_string_lossy().to_string();
            if let Some(issue_id) = issue_id_from_dir_name(&name) {
                entries.push(WorktreeEntry {
                    issue_id,
                    branch: format!("issue/{}", name.trim_start_matches("issue-")),
                    path: dir.path(),
                });
            }
        }
        entries.sort_by_key(|e| e.issue_id);
        Ok(entries)
    }

    async fn get_diff(&self, _path: &Path, _base: &str) -> Result<String, VcsError> {
        Ok(String::new())
    }

    async fn merge(&self, issue_id: u32, _slug: &str, base: &str) -> Result<MergeResult, VcsError> {
        Ok(MergeResult {
            success: true,
            message: format!("Merged issue #{} into {}", issue_id, base),
        })
    }

    async fn commit(&self, _path: &Path, _message: &str, _files: &[String]) -> Result<String, VcsError> {
        Ok("abc1234".to_string())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    dir: TempDir,
    provider: Arc<ScriptedProvider>,
    store: Arc<FileIssueStore>,
    vcs: Arc<DirVcs>,
    orchestrator: Arc<Orchestrator>,
}

fn base_config(root: &Path) -> ResolvedConfig {
    ResolvedConfig {
        issues_dir: root.join("issues"),
        specs_dir: root.join("specs"),
        worktree_root: root.join("worktrees"),
        worker: WorkerCommandConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), LONG_WORKER.to_string()],
        },
        kill_grace: Duration::from_secs(1),
        ..ResolvedConfig::default()
    }
}

fn harness(
    replies: Vec<ProviderResponse>,
    callbacks: OrchestratorCallbacks,
    configure: impl FnOnce(&mut ResolvedConfig),
) -> Harness {
    harness_on(EndpointConfig::new("local", "http://localhost:9"), replies, callbacks, configure)
}

fn harness_on(
    endpoint: EndpointConfig,
    replies: Vec<ProviderResponse>,
    callbacks: OrchestratorCallbacks,
    configure: impl FnOnce(&mut ResolvedConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut config = base_config(&root);
    configure(&mut config);
    std::fs::create_dir_all(&config.worktree_root).unwrap();

    let provider = ScriptedProvider::new(replies);
    let router = Arc::new(Router::new(
        vec![(endpoint, Arc::clone(&provider) as SharedProvider)],
        Duration::from_secs(1),
    ));
    let store = Arc::new(FileIssueStore::new(&config.issues_dir));
    let vcs = Arc::new(DirVcs {
        root: config.worktree_root.clone(),
    });

    let orchestrator = Arc::new(
        Orchestrator::new(OrchestratorOptions {
            config,
            repo_root: root,
            router,
            issues: store.clone(),
            vcs: vcs.clone(),
            log: ConversationLog::in_memory().unwrap(),
            callbacks,
        })
        .unwrap(),
    );

    Harness {
        dir,
        provider,
        store,
        vcs,
        orchestrator,
    }
}

fn call(id: &str, name: &str, input: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}

fn tools(calls: Vec<ToolCall>) -> ProviderResponse {
    ProviderResponse::tool_calls(calls)
}

async fn create_issue(store: &FileIssueStore, title: &str, description: &str) -> u32 {
    store
        .create(NewIssue {
            title: title.to_string(),
            description: description.to_string(),
            priority: Priority::Medium,
            ..NewIssue::default()
        })
        .await
        .unwrap()
        .id
}

/// Contents of every tool_result block, in conversation order.
fn tool_results(messages: &[Message]) -> Vec<(String, bool)> {
    messages
        .iter()
        .filter_map(Message::as_blocks)
        .flatten()
        .filter(|b| b.block_type == ContentBlockType::ToolResult)
        .map(|b| (b.content.clone().unwrap_or_default(), b.is_error.unwrap_or(false)))
        .collect()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn counting_tool_calls(counter: Arc<AtomicUsize>) -> OrchestratorCallbacks {
    OrchestratorCallbacks {
        on_tool_call: Some(Arc::new(move |_: &str, _: &Value| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    }
}

// ============================================================================
// Loop guards
// ============================================================================

#[tokio::test]
async fn test_identical_tool_batches_abort_the_turn() {
    let executed = Arc::new(AtomicUsize::new(0));
    let replies = (1..=4)
        .map(|n| tools(vec![call(&format!("t{}", n), "list_issues", json!({"status": "open"}))]))
        .collect();
    let h = harness(replies, counting_tool_calls(Arc::clone(&executed)), |_| {});

    let err = h.orchestrator.chat("what is open?").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RepeatedToolCall { count: 4, .. }));
    assert_eq!(executed.load(Ordering::SeqCst), 3);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 4);

    // Every tool_use still has a matching result.
    let messages = h.orchestrator.messages().await;
    let last = messages.last().unwrap();
    assert!(last.is_tool_result());
    let (content, is_error) = tool_results(&messages).pop().unwrap();
    assert!(content.contains("Not executed"));
    assert!(is_error);
}

#[tokio::test]
async fn test_three_identical_batches_still_run() {
    let executed = Arc::new(AtomicUsize::new(0));
    let mut replies: Vec<ProviderResponse> = (1..=3)
        .map(|n| tools(vec![call(&format!("t{}", n), "list_specs", json!({}))]))
        .collect();
    replies.push(ProviderResponse::text("no specs"));
    let h = harness(replies, counting_tool_calls(Arc::clone(&executed)), |_| {});

    assert_eq!(h.orchestrator.chat("any specs?").await.unwrap(), "no specs");
    assert_eq!(executed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_iteration_cap() {
    let replies = vec![
        tools(vec![call("a", "list_issues", json!({}))]),
        tools(vec![call("b", "list_specs", json!({}))]),
        tools(vec![call("c", "worker_status", json!({}))]),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |c| c.max_iterations = 2);

    let err = h.orchestrator.chat("look around").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::MaxIterationsExceeded(2)));
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_yolo_lifts_iteration_cap() {
    let replies = vec![
        tools(vec![call("a", "list_issues", json!({}))]),
        tools(vec![call("b", "list_specs", json!({}))]),
        tools(vec![call("c", "worker_status", json!({}))]),
        ProviderResponse::text("all quiet"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |c| {
        c.max_iterations = 2;
        c.yolo = true;
    });

    assert_eq!(h.orchestrator.chat("look around").await.unwrap(), "all quiet");
}

#[tokio::test]
async fn test_unknown_tool_is_an_error_result() {
    let replies = vec![
        tools(vec![call("a", "format_disk", json!({}))]),
        ProviderResponse::text("sorry"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |_| {});

    assert_eq!(h.orchestrator.chat("hi").await.unwrap(), "sorry");
    let results = tool_results(&h.orchestrator.messages().await);
    assert_eq!(results, vec![("Unknown tool: format_disk".to_string(), true)]);
}

// ============================================================================
// Turns and approval
// ============================================================================

#[tokio::test]
async fn test_turns_run_in_submission_order() {
    let replies = vec![ProviderResponse::text("one"), ProviderResponse::text("two")];
    let h = harness(replies, OrchestratorCallbacks::default(), |_| {});
    tokio::spawn(Arc::clone(&h.orchestrator).run());

    let first = h.orchestrator.submit("first");
    let second = h.orchestrator.submit("second");

    assert_eq!(first.await.unwrap().unwrap(), "one");
    assert_eq!(second.await.unwrap().unwrap(), "two");
    assert_eq!(h.provider.seen(), vec!["first", "second"]);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_declined_destructive_tool_is_cancelled() {
    let asked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&asked);
    let callbacks = OrchestratorCallbacks {
        on_confirm: Some(Arc::new(move |confirmation: &ToolConfirmation| {
            assert_eq!(confirmation.tool_name, "delete_issue");
            counter.fetch_add(1, Ordering::SeqCst);
            false
        })),
        ..Default::default()
    };
    let replies = vec![
        tools(vec![call("d", "delete_issue", json!({"issue_id": 1}))]),
        ProviderResponse::text("kept it"),
    ];
    let h = harness(replies, callbacks, |_| {});
    create_issue(&h.store, "Keep me", "").await;

    assert_eq!(h.orchestrator.chat("delete #1").await.unwrap(), "kept it");
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert_eq!(tool_results(&h.orchestrator.messages().await), vec![(CANCELLED.to_string(), false)]);
    assert!(h.store.get(1).await.unwrap().is_some());
}

#[tokio::test]
async fn test_destructive_tool_refused_without_approval_handler() {
    let replies = vec![
        tools(vec![call("d", "delete_issue", json!({"issue_id": 1}))]),
        ProviderResponse::text("kept it"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |_| {});
    create_issue(&h.store, "Keep me", "").await;

    h.orchestrator.chat("delete #1").await.unwrap();
    assert_eq!(tool_results(&h.orchestrator.messages().await)[0].0, CANCELLED);
    assert!(h.store.get(1).await.unwrap().is_some());
}

// ============================================================================
// Workers
// ============================================================================

#[tokio::test]
async fn test_queue_drains_when_worker_finishes() {
    let replies = vec![
        tools(vec![
            call("s1", "spawn_worker", json!({"issue_id": 1})),
            call("s2", "spawn_worker", json!({"issue_id": 2})),
        ]),
        ProviderResponse::text("both handled"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |c| {
        c.max_workers = 1;
        c.worker.args = vec!["-c".to_string(), GATED_WORKER.to_string()];
    });
    create_issue(&h.store, "First task", "").await;
    create_issue(&h.store, "Second task", "").await;
    tokio::spawn(Arc::clone(&h.orchestrator).run());

    h.orchestrator.submit("start both").await.unwrap().unwrap();
    assert_eq!(h.orchestrator.running_workers().await, vec![1]);
    let queued: Vec<u32> = h.orchestrator.queued_workers().await.iter().map(|q| q.issue_id).collect();
    assert_eq!(queued, vec![2]);
    let results = tool_results(&h.orchestrator.messages().await);
    assert!(results[1].0.contains("queued at position 1"), "{}", results[1].0);

    let worktree = h.vcs.list_worktrees().await.unwrap()[0].path.clone();
    std::fs::write(worktree.join("go"), "").unwrap();

    let o = Arc::clone(&h.orchestrator);
    eventually("issue #2 to start", || {
        let o = Arc::clone(&o);
        async move { o.running_workers().await == vec![2] }
    })
    .await;
    assert!(h.orchestrator.queued_workers().await.is_empty());
    assert_eq!(h.store.get(1).await.unwrap().unwrap().status, IssueStatus::Review);
    assert_eq!(h.store.get(2).await.unwrap().unwrap().status, IssueStatus::InProgress);

    let provider = Arc::clone(&h.provider);
    eventually("the worker report turn", || {
        let provider = Arc::clone(&provider);
        async move { provider.seen().iter().any(|m| m.starts_with("[Worker report]")) }
    })
    .await;

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_paths_warn_on_spawn() {
    let replies = vec![
        tools(vec![call("s1", "spawn_worker", json!({"issue_id": 1}))]),
        tools(vec![call("s2", "spawn_worker", json!({"issue_id": 2}))]),
        ProviderResponse::text("started"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |c| c.max_workers = 2);
    create_issue(&h.store, "Session refactor", "Refactor src/auth/session.rs").await;
    create_issue(&h.store, "Add MFA", "Add MFA to src/auth/login.rs").await;

    h.orchestrator.chat("start both").await.unwrap();
    let results = tool_results(&h.orchestrator.messages().await);
    assert!(!results[0].0.contains("Warning"));
    assert!(
        results[1].0.contains("Warning: issue #2 may conflict with running #1 (shared path src/auth)"),
        "{}",
        results[1].0
    );
    assert_eq!(h.orchestrator.running_workers().await, vec![1, 2]);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_delete_stops_worker_and_frees_slot() {
    let replies = vec![
        tools(vec![call("s1", "spawn_worker", json!({"issue_id": 1}))]),
        ProviderResponse::text("running"),
        tools(vec![call("d1", "delete_issue", json!({"issue_id": 1}))]),
        ProviderResponse::text("gone"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |c| c.yolo = true);
    create_issue(&h.store, "Doomed", "").await;

    h.orchestrator.chat("start it").await.unwrap();
    let worker = h.orchestrator.worker(1).await.unwrap();
    assert!(worker.is_running());
    assert_eq!(h.orchestrator.router().snapshot()[0].reserved_slots, 1);

    assert_eq!(h.orchestrator.chat("delete it").await.unwrap(), "gone");
    assert!(!worker.is_running());
    assert!(h.orchestrator.running_workers().await.is_empty());
    assert_eq!(h.orchestrator.router().snapshot()[0].reserved_slots, 0);
    assert!(h.store.get(1).await.unwrap().is_none());
    assert!(h.vcs.list_worktrees().await.unwrap().is_empty());
    let results = tool_results(&h.orchestrator.messages().await);
    assert!(results[1].0.contains("stopped its worker"), "{}", results[1].0);
}

async fn worktree_of(vcs: &DirVcs, issue_id: u32) -> PathBuf {
    vcs.list_worktrees()
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.issue_id == issue_id)
        .unwrap()
        .path
}

/// One endpoint that fits a single worker, and turns that stop right after
/// their first tool batch so the manager holds no request afterwards.
fn single_slot_harness() -> Harness {
    let replies = vec![tools(vec![
        call("s1", "spawn_worker", json!({"issue_id": 1})),
        call("s2", "spawn_worker", json!({"issue_id": 2})),
    ])];
    harness_on(
        EndpointConfig::new("local", "http://localhost:9").with_max_concurrent(1),
        replies,
        OrchestratorCallbacks::default(),
        |c| {
            c.max_workers = 2;
            c.max_iterations = 1;
            c.worker.args = vec!["-c".to_string(), GATED_WORKER.to_string()];
        },
    )
}

#[tokio::test]
async fn test_spawn_without_endpoint_capacity_is_queued() {
    let h = single_slot_harness();
    create_issue(&h.store, "First task", "").await;
    create_issue(&h.store, "Second task", "").await;

    let err = h.orchestrator.chat("start both").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::MaxIterationsExceeded(1)));
    assert_eq!(h.orchestrator.running_workers().await, vec![1]);
    let queued: Vec<u32> = h.orchestrator.queued_workers().await.iter().map(|q| q.issue_id).collect();
    assert_eq!(queued, vec![2]);
    let results = tool_results(&h.orchestrator.messages().await);
    assert!(results[1].0.contains("No endpoint has capacity"), "{}", results[1].0);
    assert!(results[1].0.contains("queued at position 1"), "{}", results[1].0);
    assert_eq!(h.store.get(2).await.unwrap().unwrap().status, IssueStatus::Open);

    tokio::spawn(Arc::clone(&h.orchestrator).run());
    std::fs::write(worktree_of(&h.vcs, 1).await.join("go"), "").unwrap();

    let o = Arc::clone(&h.orchestrator);
    eventually("issue #2 to start", || {
        let o = Arc::clone(&o);
        async move { o.running_workers().await == vec![2] }
    })
    .await;
    assert!(h.orchestrator.queued_workers().await.is_empty());
    assert_eq!(h.store.get(2).await.unwrap().unwrap().status, IssueStatus::InProgress);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_endpoint_recovery_starts_queued_worker() {
    let h = single_slot_harness();
    create_issue(&h.store, "First task", "").await;
    create_issue(&h.store, "Second task", "").await;
    let _ = h.orchestrator.chat("start both").await;
    assert_eq!(h.orchestrator.running_workers().await, vec![1]);

    h.provider.healthy.store(false, Ordering::SeqCst);
    assert_eq!(h.orchestrator.router().check_health().await, 1);

    tokio::spawn(Arc::clone(&h.orchestrator).run());
    std::fs::write(worktree_of(&h.vcs, 1).await.join("go"), "").unwrap();

    let store = Arc::clone(&h.store);
    eventually("issue #1 to reach review", || {
        let store = Arc::clone(&store);
        async move { store.get(1).await.unwrap().unwrap().status == IssueStatus::Review }
    })
    .await;
    // The slot is free but the only endpoint is down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.orchestrator.running_workers().await.is_empty());
    let queued: Vec<u32> = h.orchestrator.queued_workers().await.iter().map(|q| q.issue_id).collect();
    assert_eq!(queued, vec![2]);

    h.provider.healthy.store(true, Ordering::SeqCst);
    assert_eq!(h.orchestrator.router().check_health().await, 1);

    let o = Arc::clone(&h.orchestrator);
    eventually("issue #2 to start after recovery", || {
        let o = Arc::clone(&o);
        async move { o.running_workers().await == vec![2] }
    })
    .await;
    assert!(h.orchestrator.queued_workers().await.is_empty());

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_failed_queued_launch_is_reported() {
    let failed = Arc::new(Mutex::new(Vec::new()));
    let callbacks = {
        let failed = Arc::clone(&failed);
        OrchestratorCallbacks {
            on_event: Some(Arc::new(move |event: &OrchestratorEvent| {
                if let OrchestratorEvent::LaunchFailed { issue_id, .. } = event {
                    failed.lock().unwrap().push(*issue_id);
                }
            })),
            ..Default::default()
        }
    };
    let replies = vec![
        tools(vec![
            call("s1", "spawn_worker", json!({"issue_id": 1})),
            call("s2", "spawn_worker", json!({"issue_id": 2})),
        ]),
        ProviderResponse::text("one at a time"),
    ];
    let h = harness(replies, callbacks, |c| {
        c.max_workers = 1;
        c.worker.args = vec!["-c".to_string(), GATED_WORKER.to_string()];
    });
    create_issue(&h.store, "First task", "").await;
    let second = create_issue(&h.store, "Second task", "").await;
    h.orchestrator.chat("start both").await.unwrap();
    assert_eq!(h.orchestrator.queued_workers().await.len(), 1);

    // A plain file where #2's worktree would go makes its launch fail.
    let slug = h.store.get(second).await.unwrap().unwrap().slug;
    std::fs::write(h.vcs.root.join(worktree_dir_name(second, &slug)), "").unwrap();

    tokio::spawn(Arc::clone(&h.orchestrator).run());
    std::fs::write(worktree_of(&h.vcs, 1).await.join("go"), "").unwrap();

    let provider = Arc::clone(&h.provider);
    eventually("the launch failure report", || {
        let provider = Arc::clone(&provider);
        async move {
            provider
                .seen()
                .iter()
                .any(|m| m.starts_with("[Worker report] Issue #2 left the queue"))
        }
    })
    .await;
    assert_eq!(*failed.lock().unwrap(), vec![2]);
    assert!(h.orchestrator.queued_workers().await.is_empty());
    assert!(h.orchestrator.running_workers().await.is_empty());
    assert_eq!(h.store.get(second).await.unwrap().unwrap().status, IssueStatus::Open);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_spawn_rejects_issue_in_review() {
    let replies = vec![
        tools(vec![call("s1", "spawn_worker", json!({"issue_id": 1}))]),
        ProviderResponse::text("no"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |_| {});
    let id = create_issue(&h.store, "Reviewed", "").await;
    h.store.update_status(id, IssueStatus::InProgress).await.unwrap();
    h.store.update_status(id, IssueStatus::Review).await.unwrap();

    h.orchestrator.chat("start it").await.unwrap();
    let results = tool_results(&h.orchestrator.messages().await);
    assert!(results[0].0.contains("Only open or blocked issues"), "{}", results[0].0);
    assert!(h.orchestrator.running_workers().await.is_empty());
    assert_eq!(h.orchestrator.router().snapshot()[0].reserved_slots, 0);
}

#[tokio::test]
async fn test_merge_marks_done_and_removes_worktree() {
    let replies = vec![
        tools(vec![call("m1", "merge_issue", json!({"issue_id": 1}))]),
        ProviderResponse::text("merged"),
    ];
    let h = harness(replies, OrchestratorCallbacks::default(), |c| c.yolo = true);
    let id = create_issue(&h.store, "Ready", "").await;
    h.store.update_status(id, IssueStatus::InProgress).await.unwrap();
    h.store.update_status(id, IssueStatus::Review).await.unwrap();
    let slug = h.store.get(id).await.unwrap().unwrap().slug;
    h.vcs.create_worktree(id, &slug, "main").await.unwrap();

    h.orchestrator.chat("merge it").await.unwrap();
    let results = tool_results(&h.orchestrator.messages().await);
    assert!(results[0].0.starts_with("Merged issue #1 into main"), "{}", results[0].0);
    assert_eq!(h.store.get(id).await.unwrap().unwrap().status, IssueStatus::Done);
    assert!(h.vcs.list_worktrees().await.unwrap().is_empty());
}

// ============================================================================
// Recovery and history
// ============================================================================

#[tokio::test]
async fn test_recovery_resets_orphaned_issues() {
    let h = harness(Vec::new(), OrchestratorCallbacks::default(), |_| {});
    let running = create_issue(&h.store, "Was running", "").await;
    let reviewing = create_issue(&h.store, "Was in review", "").await;
    let open = create_issue(&h.store, "Still open", "").await;

    h.store.update_status(running, IssueStatus::InProgress).await.unwrap();
    h.store.update_status(reviewing, IssueStatus::InProgress).await.unwrap();
    h.store.update_status(reviewing, IssueStatus::Review).await.unwrap();
    for id in [running, reviewing, open] {
        let slug = h.store.get(id).await.unwrap().unwrap().slug;
        h.vcs.create_worktree(id, &slug, "main").await.unwrap();
    }
    std::fs::create_dir_all(h.vcs.root.join("issue-9-gone")).unwrap();

    let report = h.orchestrator.recover().await.unwrap();
    let reset: Vec<u32> = report.reset.iter().map(|r| r.issue_id).collect();
    assert_eq!(reset, vec![running, reviewing]);
    assert_eq!(report.stray_worktrees, vec![h.vcs.root.join("issue-9-gone")]);
    for id in [running, reviewing, open] {
        assert_eq!(h.store.get(id).await.unwrap().unwrap().status, IssueStatus::Open);
    }

    // The summary reaches the manager with the next message.
    h.orchestrator.chat("hello").await.unwrap();
    let seen = h.provider.seen();
    assert!(seen[0].starts_with("[Startup recovery]"));
    assert!(seen[0].ends_with("hello"));
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("conversation.db");
    let build = |log: ConversationLog| {
        let provider = ScriptedProvider::new(vec![ProviderResponse::text("noted")]);
        let router = Arc::new(Router::new(
            vec![(EndpointConfig::new("local", "http://localhost:9"), provider as SharedProvider)],
            Duration::from_secs(1),
        ));
        let config = base_config(dir.path());
        Orchestrator::new(OrchestratorOptions {
            issues: Arc::new(FileIssueStore::new(&config.issues_dir)),
            vcs: Arc::new(DirVcs {
                root: config.worktree_root.clone(),
            }),
            config,
            repo_root: dir.path().to_path_buf(),
            router,
            log,
            callbacks: OrchestratorCallbacks::default(),
        })
        .unwrap()
    };

    let first = build(ConversationLog::open(&log_path).unwrap());
    first.chat("remember the login page").await.unwrap();
    drop(first);

    let second = build(ConversationLog::open(&log_path).unwrap());
    let messages = second.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].as_text(), Some("remember the login page"));
}

#[tokio::test]
async fn test_shutdown_rejects_new_turns() {
    let h = harness(Vec::new(), OrchestratorCallbacks::default(), |_| {});
    h.orchestrator.shutdown().await;
    assert!(matches!(
        h.orchestrator.chat("anyone there?").await,
        Err(OrchestratorError::ShutDown)
    ));
    drop(h.dir);
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn test_run_loop_can_be_spawned() {
    let h = harness(Vec::new(), OrchestratorCallbacks::default(), |_| {});
    let run = Arc::clone(&h.orchestrator).run();
    assert_send(&run);
    drop(run);

    let handle = tokio::spawn(Arc::clone(&h.orchestrator).run());
    h.orchestrator.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}
