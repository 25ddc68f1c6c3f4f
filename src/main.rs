//! Swap Router - MPC-signed cross-chain swap orchestration
//!
//! The router watches deposits on source chains, verifies them, and pays out
//! on destination chains with transactions signed by an MPC group. Payouts
//! are tracked until stable and replaced or reswapped when they get stuck.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod metrics;
mod mpc;
mod store;
mod swap;
mod tx;
mod worker;

#[cfg(test)]
mod test_utils;

use chain::{BridgeRegistry, EvmBridge};
use config::{Settings, StoreBackend};
use metrics::MetricsServer;
use mpc::{LocalSigner, MpcClient, SignerService};
use store::{MemorySwapStore, PgSwapStore, SwapStore};
use worker::{Shutdown, WorkerContext, Workers};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Swap Router v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Arc::new(Settings::load()?);
    info!(
        "Loaded configuration for {} chains as {:?} node {}",
        settings.enabled_chains().len(),
        settings.router.role,
        settings.router.identifier
    );

    // Initialize swap store
    let store: Arc<dyn SwapStore> = match settings.database.backend {
        StoreBackend::Postgres => {
            let pg = PgSwapStore::new(&settings.database).await?;
            info!("Database connection established");
            pg.run_migrations().await?;
            info!("Database migrations complete");
            Arc::new(pg)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory swap store, state is lost on restart");
            Arc::new(MemorySwapStore::new())
        }
    };

    // Initialize signer
    let signer: Arc<dyn SignerService> = if settings.mpc.enabled {
        Arc::new(MpcClient::new(settings.mpc.clone())?)
    } else {
        Arc::new(LocalSigner::from_env()?)
    };

    // Initialize one bridge per enabled chain
    let registry = Arc::new(BridgeRegistry::new());
    for (name, chain_config) in settings.enabled_chains() {
        let bridge = EvmBridge::new(
            chain_config.clone(),
            signer.clone(),
            settings.router.parallel_swap,
            settings.worker.nonce_recycle_ack_secs,
        )?;
        // Parallel dispatch allocates from the cache and needs a seeded nonce
        if settings.router.parallel_swap {
            bridge
                .init_nonce()
                .await
                .with_context(|| format!("seed nonce for chain {}", name))?;
        }
        registry.insert(Arc::new(bridge));
    }
    info!("Chain connections initialized");

    let shutdown = Shutdown::new();
    let ctx = WorkerContext::new(
        settings.clone(),
        registry.clone(),
        store.clone(),
        signer,
        shutdown.clone(),
    );
    let workers = Workers::new(ctx);
    let worker_handles = workers.start();

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState::new(&workers);
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let registry = registry.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(settings.router.health_check_interval_secs.max(1));
        async move {
            while shutdown.sleep(interval).await {
                let mut healthy = true;
                for (chain_id, ok) in registry.health_check().await {
                    metrics::record_chain_health(chain_id, ok);
                    if !ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if !store.health_check().await {
                    warn!("Store health check failed");
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Swap Router is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    shutdown.trigger();

    // Give in-flight tasks a grace period before giving up on them
    let grace = Duration::from_secs(settings.worker.shutdown_grace_secs);
    let drain = futures::future::join_all(worker_handles);
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("Workers did not stop within {:?}", grace);
    }

    if tokio::time::timeout(grace, api_handle).await.is_err() {
        warn!("API server did not stop within {:?}", grace);
    }
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap Router stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_router=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("SWAP_ROUTER_LOG_JSON").is_ok();
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
