//! Pairline Daemon
//!
//! Multi-tenant messaging session registry with live pairing streams.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::pairing::{generate_png_qr, generate_terminal_qr};
use daemon::protocol::SessionEvent;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Pairline Daemon - multi-tenant messaging sessions paired by QR code.
#[derive(Parser, Debug)]
#[command(name = "pairline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the Pairline daemon
    Start {
        /// Override the HTTP port from the configuration
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Render a pairing token as a QR code
    RenderCode {
        /// Raw pairing token to encode
        token: String,

        /// Output format for the pairing code
        #[arg(long, short, value_enum, default_value = "terminal")]
        format: CodeFormat,

        /// Output file path for PNG format (defaults to ./pairing-qr.png)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration inspection.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Validate the configuration and exit
    Check,
}

/// Output format for pairing codes.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeFormat {
    /// Display as block art in the terminal
    Terminal,
    /// Generate a PNG QR code
    Png,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Start { port } => {
            if let Some(port) = port {
                config.http.port = port;
            }
            config.validate()?;

            tracing::info!("Pairline daemon starting...");
            let orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&orchestrator).await?;
        }
        Commands::RenderCode {
            token,
            format,
            output,
        } => match format {
            CodeFormat::Terminal => {
                let art = generate_terminal_qr(&token)?;
                println!("{}", art);
            }
            CodeFormat::Png => {
                let path = output.unwrap_or_else(|| PathBuf::from("pairing-qr.png"));
                generate_png_qr(&token, &path)?;
                println!("QR code saved to: {}", path.display());
            }
        },
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Check) => match config.validate() {
            Ok(()) => println!("Configuration OK: {}", config_path.display()),
            Err(e) => {
                eprintln!("Invalid configuration in {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

/// Initialize tracing: stderr always, plus a daily rolling file when
/// `log_dir` is configured. The returned guard flushes the file writer.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "pairline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(guard)
}

/// Run the daemon until a shutdown signal arrives.
async fn run_headless(orchestrator: &DaemonOrchestrator) -> anyhow::Result<()> {
    // Subscribe before starting so no state change is missed
    let mut events = orchestrator.subscribe();

    // Spawn event logging task
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Session(event) => log_session_event(&event),
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

fn log_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Code { session_id, .. } => {
            tracing::info!(session_id = %session_id, "Pairing code issued");
        }
        SessionEvent::Ready {
            session_id,
            phone_identity,
            ..
        } => {
            tracing::info!(session_id = %session_id, phone = ?phone_identity, "Session ready");
        }
        SessionEvent::AuthFailure { session_id, .. } => {
            if let Some(error) = event.failure() {
                tracing::warn!(session_id = %session_id, error = %error, "Pairing rejected");
            }
        }
        SessionEvent::Disconnected { session_id, reason } => {
            tracing::warn!(session_id = %session_id, reason = %reason, "Session disconnected");
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C).
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
