use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use shipwright::config::{Config, DEFAULT_CONFIG_PATH};
use shipwright::coordinator::Coordinator;
use shipwright::logging::{self, LogFormat};
use shipwright::server;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Multi-project build and release coordinator")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "SHIPWRIGHT_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator and its HTTP API
    Serve {
        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,

        #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
        log_format: LogFormat,
    },
    /// Validate the configuration file and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, log_format } => serve(&cli.config, port, log_format).await,
        Commands::CheckConfig => check_config(&cli.config),
    }
}

fn check_config(path: &std::path::Path) -> Result<()> {
    let config = Config::load(path)?;
    println!(
        "Configuration OK: {} project(s): {}",
        config.projects.len(),
        config.project_names().join(", ")
    );
    Ok(())
}

async fn serve(path: &std::path::Path, port: Option<u16>, log_format: LogFormat) -> Result<()> {
    let mut config = Config::load(path)?;
    if let Some(port) = port {
        config.http.port = port;
    }

    let _log_guard = logging::init_logging(log_format, config.log_file.as_deref())?;
    tracing::info!(projects = ?config.project_names(), "configuration loaded");

    let coordinator = Arc::new(Coordinator::from_config(&config));
    let cancel = CancellationToken::new();
    let handles = coordinator.start(cancel.clone()).await;
    tokio::spawn(shutdown_signal(cancel.clone()));

    let result = server::start_server(&config.http, coordinator, cancel.clone()).await;

    // Loops finish their in-flight external call before exiting.
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    tracing::info!("shutdown complete");
    result
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => return,
    }

    tracing::info!("shutdown requested");
    cancel.cancel();
}
