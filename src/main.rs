//! `vigil` - autonomous incident-response coordinator daemon
//!
//! This binary wires the coordination kernel to the outside world: config
//! loading, the TCP/TLS wire server, signal handling and exit codes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use vigil_core::guardrail::AllowAll;
use vigil_core::orchestrator::LoggingActionExecutor;
use vigil_core::secrets::EnvSecretStore;
use vigil_core::{VigilApi, VigilConfig, VigilError};

mod server;

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_STORE_UNREACHABLE: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_REVISION"), ")");

#[derive(Parser)]
#[command(name = "vigil", version = VERSION, about = "Autonomous incident-response coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination server
    Serve {
        /// Path to the TOML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Override the bind address from the config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Validate a configuration file and exit
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind } => match serve(config, bind).await {
            Ok(interrupted) => {
                if interrupted {
                    ExitCode::from(EXIT_INTERRUPTED)
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "startup failed");
                ExitCode::from(classify_exit(&err))
            }
        },
        Commands::CheckConfig { config } => match VigilConfig::load(&config) {
            Ok(_) => {
                println!("configuration ok: {}", config.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("configuration error: {}", err);
                ExitCode::from(EXIT_CONFIG_ERROR)
            }
        },
    }
}

/// Runs until interrupted. Returns true when a signal stopped us.
async fn serve(config_path: Option<PathBuf>, bind_override: Option<String>) -> Result<bool> {
    let config = load_config(config_path)?;
    let bind = bind_override.unwrap_or_else(|| config.server.bind.clone());

    let tls = match &config.server.tls {
        Some(section) => Some(
            server::tls_acceptor(&section.cert_path, &section.key_path)
                .context("tls configuration")?,
        ),
        None => None,
    };

    let api = VigilApi::from_config(
        &config,
        &EnvSecretStore,
        Arc::new(AllowAll),
        Arc::new(LoggingActionExecutor),
    )?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_shutdown.cancel();
        }
    });

    server::run(api.clone(), &bind, tls, shutdown.clone()).await?;

    // Accept loop returned: either a signal or an unrecoverable bind error
    api.shutdown();
    Ok(shutdown.is_cancelled())
}

fn load_config(path: Option<PathBuf>) -> Result<VigilConfig> {
    match path {
        Some(path) => Ok(VigilConfig::load(&path)?),
        None => {
            for candidate in ["vigil.toml", "/etc/vigil/vigil.toml"] {
                let candidate = PathBuf::from(candidate);
                if candidate.exists() {
                    return Ok(VigilConfig::load(&candidate)?);
                }
            }
            tracing::warn!("no config file found, using defaults (no providers registered)");
            Ok(VigilConfig::default())
        }
    }
}

fn classify_exit(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<VigilError>() {
        Some(VigilError::Validation { .. }) | Some(VigilError::NotFound { .. }) => {
            EXIT_CONFIG_ERROR
        }
        Some(VigilError::Transport { .. }) | Some(VigilError::Corruption { .. }) => {
            EXIT_STORE_UNREACHABLE
        }
        _ => 1,
    }
}
