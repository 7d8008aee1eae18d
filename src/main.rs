// =============================================================================
// Multi-Account Trading Orchestrator — Main Entry Point
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use trading_orchestrator::app_state::AppState;
use trading_orchestrator::config::AppConfig;
use trading_orchestrator::repository::PostgresRepository;
use trading_orchestrator::upstream::HttpUpstreamClient;
use trading_orchestrator::{api, repository, upstream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let app_config = AppConfig::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&app_config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Multi-Account Trading Orchestrator — Starting     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Connect to storage ────────────────────────────────────────────
    let repository = PostgresRepository::connect(&app_config.database.url())
        .await
        .context("failed to connect to database")?;
    repository
        .migrate()
        .await
        .context("failed to run schema migrations")?;
    let repository: Arc<dyn repository::Repository> = Arc::new(repository);

    // ── 3. Upstream client ───────────────────────────────────────────────
    let upstream: Arc<dyn upstream::UpstreamClient> =
        Arc::new(HttpUpstreamClient::new(app_config.api_base_url.clone()));

    // ── 4. Wire shared state ─────────────────────────────────────────────
    let state = AppState::new(app_config, repository, upstream)
        .context("failed to initialise application state")?;

    info!("Credential vault initialised, session pool ready");

    // ── 5. Start the background scheduler ────────────────────────────────
    state.scheduler.start();
    info!("Scheduler running: session refresh, session health, position monitoring, heartbeat");

    // ── 6. Start the API server ──────────────────────────────────────────
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let router = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "API server exited with error");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.scheduler.shutdown().await;
    server.abort();

    info!("Orchestrator shut down complete.");
    Ok(())
}
