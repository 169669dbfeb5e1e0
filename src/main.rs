//! Lattice Bridge - cross-chain bridge coordinator
//!
//! Observes deposits on the source chain and burn events on the
//! destination chain, verifies them against the protocol contracts, and
//! emits threshold-signed mirror transactions in the opposite direction.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod api;
mod bridge;
mod config;
mod dcrm;
mod error;
mod metrics;
mod store;
mod worker;

use bridge::BridgePair;
use config::Settings;
use dcrm::{DcrmSigner, RpcDcrmClient};
use metrics::MetricsServer;
use store::PostgresStore;
use worker::WorkerContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Lattice Bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration, identifier {}",
        settings.identity.identifier
    );

    // Initialize database connection
    let store = Arc::new(PostgresStore::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    store.run_migrations().await?;

    // Threshold signer client, shared by both bridges
    let dcrm: Arc<dyn DcrmSigner> = Arc::new(RpcDcrmClient::new(&settings.dcrm)?);

    // Connect both chain bridges. Configuration mismatches (wrong chain
    // id, invalid addresses) abort here, before any worker starts.
    let src = bridge::connect_bridge(
        settings.src_token.clone(),
        settings.src_gateway.clone(),
        dcrm.clone(),
        true,
    )
    .await?;
    info!("Source bridge initialized, chain id {}", src.chain_id());

    let dst = bridge::connect_bridge(
        settings.dest_token.clone(),
        settings.dest_gateway.clone(),
        dcrm.clone(),
        false,
    )
    .await?;
    info!("Destination bridge initialized, chain id {}", dst.chain_id());

    let bridges = BridgePair { src, dst };

    // Worker context: store, bridge pair and intervals, injected into
    // every job.
    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        bridges: bridges.clone(),
        config: settings.worker.clone(),
    });

    let mut handles = Vec::new();
    handles.extend(worker::start_verify_job(&ctx));
    handles.extend(worker::start_swap_job(&ctx));
    handles.extend(worker::start_stable_job(&ctx));
    handles.extend(worker::start_height_pollers(&ctx));
    info!("Workers started");

    // Start API server
    let api_state = api::AppState {
        store: store.clone(),
        bridges,
        identifier: settings.identity.identifier.clone(),
        src_token: settings.src_token.clone(),
        dest_token: settings.dest_token.clone(),
    };
    let api_config = settings.api.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = api::run_server(api_config, api_state).await {
            error!("API server error: {}", e);
        }
    }));

    // Start metrics server
    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    info!("Lattice Bridge is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    for handle in handles {
        handle.abort();
    }

    info!("Lattice Bridge stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lattice_bridge=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
