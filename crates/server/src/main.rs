use anyhow::Context;
use db::DBService;
use server::{AppState, routes};
use services::services::{config::ResilienceConfig, database::Database};
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "sqlite://resilience.db";
const DEFAULT_PORT: u16 = 3001;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    utils::sentry::init_tracing("info,server=debug,services=debug");

    let config = ResilienceConfig::from_env().context("failed to load resilience config")?;
    let sentry_dsn = std::env::var("SENTRY_DSN").ok();
    utils::sentry::init_once(sentry_dsn.as_deref(), &config.environment.to_string());

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let max_connections = config.database.max_connections;
    let db = DBService::new(&database_url, max_connections)
        .await
        .with_context(|| format!("failed to open database at {database_url}"))?;

    let (state, _db_events) = AppState::build(db, config);
    Database::install(state.database().clone());

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    info!("Server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
