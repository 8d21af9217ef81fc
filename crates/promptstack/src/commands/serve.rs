//! `promptstack serve`.

use anyhow::Context;
use promptstack_core::{maintenance, Engine, EngineConfig, ProjectRegistry};
use promptstack_sandbox::DockerProvider;
use promptstack_server::AppState;
use promptstack_storage::default_storage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the HTTP server until interrupted, then kill every live project.
pub async fn run_server(config: EngineConfig, address: Option<SocketAddr>) -> anyhow::Result<()> {
    let address = match address {
        Some(address) => address,
        None => config
            .server
            .address
            .parse()
            .with_context(|| format!("Invalid server.address: {}", config.server.address))?,
    };
    info!(%address, "Starting promptstack server");

    let storage = default_storage().context("Could not determine the data directory")?;
    let provider = DockerProvider::connect(config.docker.clone())
        .await
        .context("Could not connect to Docker")?;
    let maintenance_enabled = config.maintenance.enabled;
    let engine = Engine::builder(config, Arc::new(provider), Arc::new(storage)).build()?;

    match engine.pool().restore().await {
        Ok(restored) => info!(restored, "Restored prepared pool ledger"),
        Err(e) => warn!(error = %e, "Failed to restore prepared pool ledger"),
    }
    if !maintenance_enabled {
        // Nothing else will fill the pool.
        let pool = engine.pool().clone();
        tokio::spawn(async move {
            pool.top_up().await;
        });
    }

    let registry = Arc::new(ProjectRegistry::new(engine));
    let cancel = CancellationToken::new();
    let maintenance = maintenance::spawn(registry.clone(), cancel.clone());

    let result = promptstack_server::serve(AppState::new(registry.clone()), address, shutdown_signal()).await;

    info!("Shutting down");
    cancel.cancel();
    if let Some(task) = maintenance {
        let _ = task.await;
    }
    registry.kill_all().await;
    result.context("Server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
