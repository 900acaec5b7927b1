use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use tollgate_escalation::Console;
use tollgate_kernel::{KernelBuilder, TollgateConfig, discover_tools};
use tollgate_protocol::{KernelResult, TerminationReason};
use tollgate_runtime::ChatSurface;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tollgated")]
#[command(about = "Policy-gated LLM agent sessions")]
struct Cli {
    /// Config file; defaults to .tollgate/config.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
    /// Used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session on stdin/stdout (the default).
    Chat {
        /// First user message; further input is read from stdin.
        #[arg(long)]
        message: Option<String>,
    },
    /// List discovered tools and their classification.
    Tools {
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Chat over the process console.
struct ConsoleSurface {
    console: Console,
}

#[async_trait]
impl ChatSurface for ConsoleSurface {
    async fn next_input(&mut self) -> KernelResult<Option<String>> {
        self.console.prompt("\nyou> ").await
    }

    async fn show_assistant(&mut self, text: &str) -> KernelResult<()> {
        self.console.write(&format!("\nassistant> {text}\n")).await
    }
}

async fn chat(config: TollgateConfig, message: Option<String>) -> Result<ExitCode> {
    let kernel = KernelBuilder::new(config)
        .build()
        .await
        .context("failed to start kernel")?;
    let mut surface = ConsoleSurface {
        console: kernel.console().clone(),
    };

    let mut session = kernel.open_session();
    let cancel = session.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            cancel.cancel();
        }
    });

    let reason = kernel.run(&mut session, message, &mut surface).await;
    interrupt.abort();

    if let Some(status) = kernel.sync_status() {
        info!(
            state = %status.state,
            pending_audit = status.pending_audit,
            dropped_audit = status.dropped_audit,
            "enterprise sync status at exit"
        );
    }
    kernel.shutdown().await;

    match reason {
        TerminationReason::FatalError { error } => {
            eprintln!("session ended with an error: {error}");
            Ok(ExitCode::FAILURE)
        }
        TerminationReason::MaxTurns => {
            warn!("session stopped at the turn limit");
            Ok(ExitCode::SUCCESS)
        }
        TerminationReason::UserExit => Ok(ExitCode::SUCCESS),
    }
}

async fn tools(config: TollgateConfig, json: bool) -> Result<ExitCode> {
    let registry = discover_tools(&config, Vec::new()).await?;
    let tools = registry.metadata();
    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        for tool in tools {
            println!("{:<24} {:<8} {}", tool.name, tool.risk, tool.category);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level);

    let config = TollgateConfig::load(cli.config.as_deref()).context("failed to load config")?;
    match cli.command.unwrap_or(Command::Chat { message: None }) {
        Command::Chat { message } => chat(config, message).await,
        Command::Tools { json } => tools(config, json).await,
    }
}
