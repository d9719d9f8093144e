//! Maestro CLI: a line-oriented REPL over the orchestrator plus connectivity
//! probes. All orchestration logic lives in the library crates; this binary
//! only wires stdin/stdout to the engine.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use maestro_config::AppConfig;
use maestro_runtime::Orchestrator;
use maestro_tools::{approval_channel, ApprovalDecision};
use maestro_workflow::SessionEvent;

const DEFAULT_CONFIG_PATH: &str = "maestro.toml";

#[derive(Debug, Parser)]
#[command(name = "maestro", version, about = "Multi-agent task orchestrator")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the orchestrator and serve a stdin REPL.
    Start {
        /// Execute approval-flagged tool calls without asking.
        #[arg(long)]
        auto_approve: bool,
    },
    /// Probe the LLM endpoint and the configured providers.
    Doctor,
    /// Write the default configuration to the config path.
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_tracing(&config);

    match cli.command {
        Commands::Start { auto_approve } => start(config, auto_approve).await,
        Commands::Doctor => doctor(config).await,
        Commands::InitConfig => {
            let config = AppConfig::default();
            config.save_to(&cli.config)?;
            println!("wrote {}", cli.config.display());
            Ok(())
        }
    }
}

/// Logs go to stderr, or to a daily-rolled file when `MAESTRO_LOG_DIR` is
/// set. The returned guard must stay alive for the file writer to flush.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));

    if let Ok(dir) = std::env::var("MAESTRO_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "maestro.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return Some(guard);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

async fn doctor(config: AppConfig) -> Result<()> {
    let orchestrator = Orchestrator::build(config, None).await?;
    if let Err(err) = orchestrator.start().await {
        eprintln!("startup degraded: {err:#}");
    }
    println!("{}", orchestrator.doctor().await);
    orchestrator.stop().await?;
    Ok(())
}

async fn start(config: AppConfig, auto_approve: bool) -> Result<()> {
    let (approval_tx, mut approval_rx) = approval_channel();
    let orchestrator = Orchestrator::build(config, Some(approval_tx)).await?;
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe_events();
    tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            match &envelope.event {
                SessionEvent::SessionSummary { .. } => {} // printed with the outcome
                event => eprintln!(
                    "[{} #{}] {}",
                    envelope.session_id,
                    envelope.seq,
                    serde_json::to_string(event).unwrap_or_default()
                ),
            }
        }
    });

    println!("maestro ready: one request per line, ctrl-d to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sessions: JoinSet<()> = JoinSet::new();
    let mut session_counter = 0u64;
    // When a tool call waits for approval, the next input line answers it.
    let mut pending_approval: Option<tokio::sync::oneshot::Sender<ApprovalDecision>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                if let Some(decision_tx) = pending_approval.take() {
                    let approved = matches!(line.to_lowercase().as_str(), "y" | "yes");
                    let _ = decision_tx.send(if approved {
                        ApprovalDecision::Approve
                    } else {
                        ApprovalDecision::Deny
                    });
                    continue;
                }

                session_counter += 1;
                let session_id = format!("repl-{session_counter}");
                let engine = orchestrator.engine().clone();
                sessions.spawn(async move {
                    match engine.run_session(&session_id, &line, None, auto_approve).await {
                        Ok(outcome) => {
                            println!("[{session_id}] {}", outcome.summary);
                        }
                        Err(err) => {
                            eprintln!("[{session_id}] error: {err}");
                            if let Some(suggestion) = err.suggestion() {
                                eprintln!("[{session_id}] suggestion: {suggestion}");
                            }
                        }
                    }
                });
            }
            Some((request, decision_tx)) = approval_rx.recv() => {
                println!(
                    "approve {} {}? [y/N]",
                    request.qualified_name,
                    serde_json::Value::Object(request.parameters.clone()),
                );
                if request.reason.is_empty() {
                    println!("  reason: flagged by inspection");
                } else {
                    println!("  reason: {}", request.reason);
                }
                pending_approval = Some(decision_tx);
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    while sessions.join_next().await.is_some() {}
    orchestrator.stop().await?;
    Ok(())
}
