use std::path::PathBuf;
use std::time::Duration;

use accounts::config::Configuration;
use accounts::{app, initialize_state, telemetry};

const CONFIG_PATH_VAR: &str = "CONFIG_PATH";
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::setup_logging();
    let handle = telemetry::setup_metrics_recorder()?;

    // read configuration file. let it in memory.
    let config = Configuration::default()
        .path(std::env::var(CONFIG_PATH_VAR).map(PathBuf::from).unwrap_or_default())
        .read()?;

    let mut state = initialize_state(config.clone()).await?;
    state.metrics = Some(handle);

    // Flush expired refresh tokens.
    let accounts = state.accounts.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(err) = accounts.purge_expired_tokens().await {
                tracing::error!(%err, "cannot purge expired refresh tokens");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(
        port = config.port,
        version = config.version(),
        "server is listening"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::error!(%err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("ctrl+c received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
