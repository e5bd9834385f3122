use std::{net::SocketAddr, sync::Arc};

use server_api::JwtAuthority;
use storage::Storage;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod http;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use http::build_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let jwt = JwtAuthority::new(settings.jwt_secret.clone(), settings.jwt_ttl_seconds);
    let relay_config = settings.relay_config();
    info!(
        default_status = %relay_config.default_message_status,
        backfill = ?relay_config.backfill_delivery,
        timeout_ms = settings.collaborator_timeout_ms,
        "relay configured"
    );
    let state = AppState::new(storage, jwt, relay_config);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
