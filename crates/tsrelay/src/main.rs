use std::sync::Arc;

use time::macros::format_description;
use tracing_subscriber::{fmt, EnvFilter};

use tsrelay::server::{router, RelayConfig, RelayState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
    let timer = fmt::time::LocalTime::new(format);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false) // disables ANSI escape codes
        .with_target(true)
        .with_level(true)
        .with_timer(timer)
        .init();

    let config = RelayConfig::from_env();
    let state = RelayState::new(config.secret.clone());
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("Relay listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    tracing::info!("Goodbye!");
    Ok(())
}

/// Resolves on SIGINT, after every live session has been told to close.
async fn shutdown_signal(state: Arc<RelayState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("signal listener failed: {}", e);
        return;
    }
    tracing::info!("Shutting down...");
    state.shutdown().await;
}
