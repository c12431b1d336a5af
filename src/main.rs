use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use lease_ledger::api::{self, AppState};
use lease_ledger::config::AppConfig;
use lease_ledger::telemetry;
use tokio::select;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;
    telemetry::init_tracing(&config.telemetry);
    info!(version = env!("CARGO_PKG_VERSION"), ledger_mode = ?config.ledger.mode, "lease ledger node starting");

    let state = Arc::new(AppState::new(&config));
    if !state.agreements.is_connected().await {
        warn!(rpc_url = %config.ledger.rpc_url, "ledger not reachable yet, requests will retry the connection");
    }

    let pruner = config.tokens.retention().map(|retention| {
        info!(retention_secs = retention.as_secs(), dir = %state.tokens.dir().display(), "token pruning enabled");
        state
            .tokens
            .clone()
            .spawn_pruning(Duration::from_secs(config.tokens.prune_interval_secs))
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let served = api::start_api_server(state.clone(), &addr, shutdown_signal()).await;
    if let Err(e) = &served {
        error!(%addr, error = %e, "API server failed");
    }

    if let Some(pruner) = pruner {
        pruner.abort();
    }
    drop(state);
    info!("lease ledger node stopped");
    Ok(served?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
