// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conductor main entry point - CLI, commands, and REPL.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use conductor::config::{self, CliOptions, ResolvedConfig};
use conductor::issues::{FileIssueStore, IssueFilter, IssueStore};
use conductor::orchestrator::{
    Orchestrator, OrchestratorCallbacks, OrchestratorEvent, OrchestratorOptions, ToolConfirmation,
};
use conductor::router::Router;
use conductor::session::{default_log_path, ConversationLog};
use conductor::telemetry::{init_telemetry, TelemetryConfig};
use conductor::vcs::GitCoordinator;
use conductor::worker::WorkerOutcome;
use conductor::VERSION;

/// Conductor - a manager agent for a team of coding agents.
#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about = "A manager agent for a team of coding agents", long_about = None)]
struct Cli {
    /// Config file to use instead of the workspace search
    #[arg(short, long, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Model for the manager conversation
    #[arg(short, long, env = "CONDUCTOR_MODEL")]
    model: Option<String>,

    /// Maximum number of concurrent workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Skip approval of destructive tools and the iteration cap
    #[arg(short = 'y', long)]
    yolo: bool,

    /// Branch worktrees are created from and merged into
    #[arg(long)]
    base_branch: Option<String>,

    /// Show tool calls and info logs
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Show debug output
    #[arg(long)]
    debug: bool,

    /// Run a single prompt and exit
    #[arg(short = 'P', long)]
    prompt: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example .conductor.json in the current directory
    Init,

    /// Show issues and endpoint health
    Status,
}

impl Cli {
    fn cli_options(&self) -> CliOptions {
        CliOptions {
            model: self.model.clone(),
            max_workers: self.max_workers,
            yolo: self.yolo.then_some(true),
            base_branch: self.base_branch.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig::from_flags(cli.verbose, cli.debug))?;

    let cwd = std::env::current_dir()?;
    let root = config::find_workspace_root(&cwd).unwrap_or(cwd);

    if let Some(command) = &cli.command {
        return handle_command(command, &cli, &root).await;
    }

    let config = config::load_config(&root, cli.config.as_deref(), cli.cli_options())?;
    run(cli, config, root).await
}

async fn handle_command(command: &Commands, cli: &Cli, root: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            let path = config::init_config(root)?;
            println!("Created config file: {}", path.display());
        }
        Commands::Status => {
            let config = config::load_config(root, cli.config.as_deref(), cli.cli_options())?;
            print_status(&config).await?;
        }
    }
    Ok(())
}

async fn print_status(config: &ResolvedConfig) -> anyhow::Result<()> {
    let store = FileIssueStore::new(&config.issues_dir);
    let issues = store.list(&IssueFilter::default()).await?;

    println!("{}", format!("conductor {}", VERSION).bright_blue().bold());
    println!("\n{}", "Issues".bright_cyan());
    if issues.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for issue in &issues {
        println!(
            "  #{:<4} {:<12} {:<7} {}",
            issue.id,
            issue.status.to_string().bright_white(),
            issue.priority,
            issue.title
        );
    }

    println!("\n{}", "Endpoints".bright_cyan());
    let router = Router::from_config(config)?;
    router.check_health().await;
    for endpoint in router.snapshot() {
        let health = if endpoint.healthy {
            "healthy".green()
        } else {
            "unhealthy".red()
        };
        let limit = endpoint
            .max_concurrent
            .map_or_else(|| "unlimited".to_string(), |max| max.to_string());
        println!(
            "  {:<16} {:<10} weight {:<3} max {:<9} {}",
            endpoint.name, health, endpoint.weight, limit, endpoint.url
        );
    }
    Ok(())
}

async fn run(cli: Cli, config: ResolvedConfig, root: PathBuf) -> anyhow::Result<()> {
    let router = Arc::new(Router::from_config(&config)?);
    router.start_health_checks(config.health_check_interval).await;
    if router.healthy_count() == 0 {
        bail!("No healthy endpoints. Check the endpoints in your config or ANTHROPIC_API_KEY.");
    }

    let issues = Arc::new(FileIssueStore::new(&config.issues_dir));
    let vcs = Arc::new(GitCoordinator::new(&root, &config.worktree_root));
    let log = ConversationLog::open(&default_log_path(&root)).context("opening conversation log")?;

    // Approval prompts only make sense while the operator is waiting on a turn.
    let user_turn = Arc::new(AtomicBool::new(false));
    let callbacks = terminal_callbacks(cli.verbose || cli.debug, Arc::clone(&user_turn));

    let orchestrator = Arc::new(Orchestrator::new(OrchestratorOptions {
        config,
        repo_root: root,
        router,
        issues,
        vcs,
        log,
        callbacks,
    })?);

    match orchestrator.recover().await {
        Ok(report) => {
            if let Some(summary) = report.summary() {
                println!("{}", summary.yellow());
            }
        }
        Err(e) => eprintln!("{} {}", "Recovery failed:".red(), e),
    }

    tokio::spawn(Arc::clone(&orchestrator).run());

    let result = match cli.prompt {
        Some(prompt) => run_turn(&orchestrator, &user_turn, prompt).await,
        None => run_repl(&orchestrator, &user_turn).await,
    };

    orchestrator.shutdown().await;
    result
}

async fn run_turn(orchestrator: &Orchestrator, user_turn: &AtomicBool, message: String) -> anyhow::Result<()> {
    user_turn.store(true, Ordering::SeqCst);
    let reply = orchestrator.submit(message).await;
    user_turn.store(false, Ordering::SeqCst);

    match reply {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => eprintln!("{} {}", "Error:".red().bold(), e),
        Err(_) => bail!("orchestrator stopped before replying"),
    }
    Ok(())
}

async fn run_repl(orchestrator: &Orchestrator, user_turn: &AtomicBool) -> anyhow::Result<()> {
    println!(
        "{} {} - type {} for worker state, {} to exit",
        "conductor".bright_blue().bold(),
        VERSION,
        "/status".cyan(),
        "/quit".cyan()
    );

    let mut editor = DefaultEditor::new()?;
    loop {
        let line = tokio::task::block_in_place(|| editor.readline(&format!("{} ", ">".green().bold())));
        let line = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        match input {
            "/quit" | "/exit" => break,
            "/status" => print_workers(orchestrator).await,
            _ => run_turn(orchestrator, user_turn, input.to_string()).await?,
        }
    }
    Ok(())
}

async fn print_workers(orchestrator: &Orchestrator) {
    let running = orchestrator.running_workers().await;
    if running.is_empty() {
        println!("{}", "No workers running.".dimmed());
    }
    for id in running {
        if let Some(worker) = orchestrator.worker(id).await {
            println!(
                "  #{:<4} {:<10} {}",
                id,
                worker.status().as_str(),
                conductor::orchestrator::format_duration(worker.elapsed())
            );
        }
    }
    for (position, queued) in orchestrator.queued_workers().await.iter().enumerate() {
        println!("  #{:<4} queued     position {}", queued.issue_id, position + 1);
    }
    for endpoint in orchestrator.router().snapshot() {
        let health = if endpoint.healthy { "up".green() } else { "down".red() };
        println!(
            "  {} {} requests {} slots {}",
            endpoint.name, health, endpoint.current_requests, endpoint.reserved_slots
        );
    }
}

fn terminal_callbacks(show_tools: bool, user_turn: Arc<AtomicBool>) -> OrchestratorCallbacks {
    let mut callbacks = OrchestratorCallbacks {
        on_text: Some(Arc::new(|text: &str| println!("{}", text))),
        on_confirm: Some(Arc::new(move |confirmation: &ToolConfirmation| {
            if !user_turn.load(Ordering::SeqCst) {
                println!(
                    "{} {} needs approval outside a user turn; declined. Use --yolo to allow it.",
                    "!".yellow(),
                    confirmation.tool_name
                );
                return false;
            }
            tokio::task::block_in_place(|| confirm(confirmation))
        })),
        on_event: Some(Arc::new(print_event)),
        ..Default::default()
    };

    if show_tools {
        callbacks.on_tool_call = Some(Arc::new(|name: &str, input: &serde_json::Value| {
            println!("{} {} {}", "→".cyan(), name.bright_white(), input.to_string().dimmed());
        }));
        callbacks.on_tool_result = Some(Arc::new(|name: &str, result: &str, is_error: bool| {
            let first = result.lines().next().unwrap_or_default();
            if is_error {
                println!("{} {} {}", "✗".red(), name, first.red());
            } else {
                println!("{} {} {}", "✓".green(), name, first.dimmed());
            }
        }));
    }
    callbacks
}

fn confirm(confirmation: &ToolConfirmation) -> bool {
    print!("{} {} [y/N] ", "?".yellow().bold(), confirmation.description);
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::WorkerStarted { issue_id, endpoint } => {
            println!("{} worker for #{} started on {}", "▶".green(), issue_id, endpoint);
        }
        OrchestratorEvent::WorkerQueued { issue_id, position } => {
            println!("{} #{} queued at position {}", "…".yellow(), issue_id, position);
        }
        OrchestratorEvent::WorkerFinished { issue_id, outcome } => {
            let line = format!("worker for #{} {}", issue_id, outcome.summary());
            match outcome {
                WorkerOutcome::Completed { .. } => println!("{} {}", "■".green(), line),
                WorkerOutcome::Blocked { .. } => println!("{} {}", "■".yellow(), line),
                WorkerOutcome::Failed { .. } => println!("{} {}", "■".red(), line),
            }
        }
        OrchestratorEvent::LaunchFailed { issue_id, error } => {
            eprintln!("{} #{} could not start: {}", "■".red(), issue_id, error);
        }
        OrchestratorEvent::ReportQueued { .. } => {}
        OrchestratorEvent::TurnFailed { error } => {
            eprintln!("{} {}", "Report turn failed:".red(), error);
        }
    }
}
