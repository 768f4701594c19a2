use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nba_orchestrator::config::{AppConfig, LogFormat};
use nba_orchestrator::server::{create_router, AppState};
use nba_orchestrator::shutdown::{graceful_shutdown, wait_for_shutdown};

#[derive(Parser)]
#[command(
    name = "nba-orchestrator",
    about = "Next Best Action recommendations for Salesforce accounts from crews of AI agents"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting NBA orchestrator"
    );

    let (state, rx) = AppState::new(config.clone()).await?;
    let state = Arc::new(state);

    // Start the run queue processor
    let queue_manager = Arc::clone(&state.manager);
    tokio::spawn(async move {
        nba_orchestrator::queue::run_queue_processor(queue_manager, rx).await;
    });

    // Resume checkpointed runs from a previous process
    let resume_state = Arc::clone(&state);
    tokio::spawn(async move {
        nba_orchestrator::queue::startup::resume_runs(&resume_state.manager, &resume_state.queue)
            .await;
    });

    let sweep_manager = Arc::clone(&state.manager);
    let sweep_interval = Duration::from_secs(config.workflow.sweep_interval_secs);
    tokio::spawn(async move {
        nba_orchestrator::queue::run_sweeper(sweep_manager, sweep_interval).await;
    });

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    // Perform graceful shutdown cleanup
    graceful_shutdown(&state).await;

    Ok(())
}
