use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing::info;

use marshal_core::{
    EngineConfig, EngineContext, HeuristicPlanner, RecordingMemorySink, SubmitRequest,
    TaskRegistry,
};
use marshal_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind,
};
use marshal_server::{serve, AppState};
use marshal_tools::ToolRegistry;
use marshal_types::{
    ApprovalDecision, EventFrame, RiskLevel, TaskContext, TaskEventKind, TaskOptions, TaskStatus,
};

const LOG_RETENTION_DAYS: u64 = 14;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "marshal-engine")]
#[command(about = "Headless Marshal task engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP task API.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3900)]
        port: u16,
        #[arg(long, env = "MARSHAL_WORKSPACE")]
        workspace: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Submit one instruction, stream its events, and exit with its outcome.
    Run {
        instruction: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
        #[arg(long, default_value_t = false)]
        preview: bool,
        #[arg(long, env = "MARSHAL_WORKSPACE")]
        workspace: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            workspace,
            config,
        } => {
            let workspace = resolve_workspace(workspace)?;
            let config =
                EngineConfig::load(config.as_deref().map(Path::new), &workspace).await?;
            let logs_dir = canonical_logs_dir_from_root(&workspace.join(".marshal"));
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    task_id: None,
                    step_index: None,
                    tool: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: Some("engine jsonl logging initialized"),
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let registry = Arc::new(build_registry(workspace, config));
            spawn_cleanup_loop(registry.clone());

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            serve(addr, AppState::new(registry)).await
        }
        Command::Run {
            instruction,
            dry_run,
            auto_approve,
            preview,
            workspace,
            config,
        } => {
            let workspace = resolve_workspace(workspace)?;
            let config =
                EngineConfig::load(config.as_deref().map(Path::new), &workspace).await?;
            let logs_dir = canonical_logs_dir_from_root(&workspace.join(".marshal"));
            let (_log_guard, _info) =
                init_process_logging(ProcessKind::Cli, &logs_dir, LOG_RETENTION_DAYS)?;

            let registry = Arc::new(build_registry(workspace, config));
            let options = TaskOptions {
                dry_run,
                auto_approve,
                generate_preview: preview || dry_run,
            };
            run_once(registry, instruction, options).await
        }
    }
}

fn resolve_workspace(raw: Option<String>) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(raw.unwrap_or_else(|| ".".to_string()));
    path.canonicalize()
        .with_context(|| format!("workspace `{}` is not accessible", path.display()))
}

fn build_registry(workspace: PathBuf, config: EngineConfig) -> TaskRegistry {
    let ctx = EngineContext::new(
        Arc::new(HeuristicPlanner),
        ToolRegistry::new(),
        workspace,
        config,
    )
    .with_memory(Arc::new(RecordingMemorySink::new()));
    TaskRegistry::new(ctx)
}

fn spawn_cleanup_loop(registry: Arc<TaskRegistry>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_expired().await;
            if removed > 0 {
                info!(removed, "evicted expired task records");
            }
        }
    });
}

async fn run_once(
    registry: Arc<TaskRegistry>,
    instruction: String,
    options: TaskOptions,
) -> anyhow::Result<()> {
    let task_id = registry
        .submit(SubmitRequest {
            instruction,
            context: TaskContext::default(),
            options,
        })
        .await;
    println!("task {task_id}");

    let mut subscription = registry.subscribe(&task_id).await?;

    // the task may have parked before this subscription existed
    let mut approval_handled = false;
    let snapshot = registry.snapshot(&task_id).await?;
    if snapshot.status == TaskStatus::AwaitingApproval {
        let decision = prompt_for_approval(snapshot.risk_level.unwrap_or_default()).await?;
        registry.resolve_approval(&task_id, decision).await?;
        approval_handled = true;
    }

    while let Some(frame) = subscription.next().await {
        match frame {
            EventFrame::Event { event } => {
                print_event_line(&event.kind, event.seq);
                if let TaskEventKind::ApprovalRequired { risk } = event.kind {
                    if !approval_handled {
                        let decision = prompt_for_approval(risk).await?;
                        registry.resolve_approval(&task_id, decision).await?;
                        approval_handled = true;
                    }
                }
            }
            EventFrame::Gap { missed } => {
                println!("  ... {missed} event(s) dropped for this observer");
            }
        }
    }

    let task = registry.snapshot(&task_id).await?;
    if let Some(preview) = &task.preview {
        println!("{}", preview.summary);
        for line in &preview.step_summaries {
            println!("  {line}");
        }
    }
    if let Some(summary) = &task.result {
        println!("{}", summary.headline);
        for artifact in &summary.artifacts {
            println!("  artifact: {artifact}");
        }
    }
    if let Some(error) = &task.error {
        match error.step_index {
            Some(index) => eprintln!("task failed at step {index}: {}", error.message),
            None => eprintln!("task failed: {}", error.message),
        }
    }

    if task.status != TaskStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event_line(kind: &TaskEventKind, seq: u64) {
    match kind {
        TaskEventKind::StatusChanged { from, to } => {
            println!("[{seq}] status {} -> {}", from.as_str(), to.as_str());
        }
        TaskEventKind::PlanReady { steps, risk } => {
            println!("[{seq}] plan ready: {steps} step(s), risk {}", risk.as_str());
        }
        TaskEventKind::StepStarted { index } => println!("[{seq}] step {index} started"),
        TaskEventKind::StepProgress { index, note } => {
            println!("[{seq}] step {index}: {note}");
        }
        TaskEventKind::StepFinished {
            index,
            status,
            attempts,
        } => {
            println!("[{seq}] step {index} finished ({status:?}, {attempts} attempt(s))");
        }
        TaskEventKind::ApprovalRequired { risk } => {
            println!("[{seq}] approval required (risk {})", risk.as_str());
        }
        TaskEventKind::ApprovalResolved { decision } => {
            println!("[{seq}] approval {decision:?}");
        }
        TaskEventKind::TaskFinished { status, .. } => {
            println!("[{seq}] task {}", status.as_str());
        }
    }
}

async fn prompt_for_approval(risk: RiskLevel) -> anyhow::Result<ApprovalDecision> {
    if !std::io::stdin().is_terminal() {
        eprintln!(
            "approval required (risk {}) but stdin is not interactive; rejecting",
            risk.as_str()
        );
        return Ok(ApprovalDecision::Rejected);
    }
    println!("proceed? [y/N]");
    let mut line = String::new();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    reader.read_line(&mut line).await?;
    Ok(
        if matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected
        },
    )
}
