//! CLI Entry Point for uv_exposure
//!
//! Provides command-line interface for:
//! - Serving the HTTP control API (`serve`)
//! - Running a single procedure file in the foreground (`run`)
//!
//! # Usage
//!
//! Start the daemon against the configured serial port:
//! ```bash
//! uv_exposure serve --bind 0.0.0.0:8000
//! ```
//!
//! Try a procedure without hardware:
//! ```bash
//! uv_exposure --mock run procedure.json
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use uv_exposure::api::{self, ProcedureBody};
use uv_exposure::config::{Settings, DEFAULT_CONFIG_PATH};
use uv_exposure::error::AppError;
use uv_exposure::hardware::{HardwareLink, MockLedLink, SerialLedLink};
use uv_exposure::logging::{self, LoggingConfig};
use uv_exposure::procedures::{ExecutorEvent, ExecutorTiming, RunOutcome};
use uv_exposure::Controller;

#[derive(Parser)]
#[command(name = "uv_exposure")]
#[command(about = "UV LED exposure controller", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated LED driver instead of the serial port
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control API
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one procedure file (JSON or TOML) and exit
    Run {
        /// Path to the procedure file
        procedure: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)?;
    settings.validate()?;
    let log_config = LoggingConfig::from_settings(&settings)?;
    logging::init(log_config.with_ansi(std::io::stdout().is_terminal()))?;

    info!(config = %cli.config.display(), mock = cli.mock, "uv_exposure starting");

    let link: Arc<dyn HardwareLink> = if cli.mock {
        Arc::new(MockLedLink::new())
    } else {
        Arc::new(SerialLedLink::connect(&settings.device))
    };
    let controller =
        Arc::new(Controller::connect(link, ExecutorTiming::from(&settings.executor)).await);

    match cli.command {
        Commands::Serve { bind } => serve(controller, &settings, bind).await,
        Commands::Run { procedure } => run_once(controller, &settings, &procedure).await,
    }
}

async fn serve(
    controller: Arc<Controller>,
    settings: &Settings,
    bind: Option<String>,
) -> Result<()> {
    let addr = bind.unwrap_or_else(|| settings.server.bind.clone());
    let router = api::build_router(
        controller.clone(),
        &settings.server,
        settings.device.channel_count,
    )?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        %addr,
        connection = %controller.connection_status(),
        link = %controller.link_description(),
        "HTTP API listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, de-energizing");
    controller.shutdown().await;
    Ok(())
}

async fn run_once(controller: Arc<Controller>, settings: &Settings, path: &Path) -> Result<()> {
    let body = load_procedure(path)?;
    let request = body
        .into_request(settings.device.channel_count)
        .map_err(AppError::from)?;

    let mut events = controller.subscribe();
    let accepted = controller
        .start_procedure(request)
        .map_err(AppError::from)?;
    info!(run_id = %accepted.run_id, file = %path.display(), "Procedure started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ExecutorEvent::Finished { outcome, .. }) => break Some(outcome),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            },
            _ = &mut shutdown => {
                warn!("Interrupted, stopping procedure");
                controller.shutdown().await;
                break controller.status_snapshot().last_outcome;
            }
        }
    };
    controller.wait_idle().await;

    match outcome {
        Some(RunOutcome::Failed { reason }) => Err(anyhow::anyhow!("procedure failed: {}", reason)),
        Some(outcome) => {
            info!(%outcome, "Procedure done");
            Ok(())
        }
        None => Ok(()),
    }
}

fn load_procedure(path: &Path) -> Result<ProcedureBody, AppError> {
    let text = std::fs::read_to_string(path)?;
    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&text).map_err(|e| e.to_string()),
        _ => serde_json::from_str(&text).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| AppError::ProcedureFile(format!("{}: {}", path.display(), e)))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
