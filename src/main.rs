//! Settlement engine daemon
//!
//! Serves the settlement and swap API for one signing account and keeps the
//! chain health gauges current.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use settlement_engine::api::{self, AppState};
use settlement_engine::bridge::AcrossQuoteClient;
use settlement_engine::chain::ChainManager;
use settlement_engine::config::Settings;
use settlement_engine::metrics::{self, MetricsServer};
use settlement_engine::swap::{OdosSwapClient, SwapOrchestrator};
use settlement_engine::tx::{AccountSender, TransactionSender};
use settlement_engine::SettlementEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting settlement engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Arc::new(Settings::load()?);
    info!(
        "Loaded configuration for {} chains, settling on {}",
        settings.enabled_chains().len(),
        settings.settlement.chain
    );

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Chain connections and the signing account
    let chain_manager = Arc::new(ChainManager::new(&settings)?);
    info!("Chain connections initialized");

    let sender = Arc::new(TransactionSender::new(chain_manager.clone(), &settings)?);
    info!("Signing as {:?}", sender.address());

    let quotes = Arc::new(AcrossQuoteClient::new(&settings.bridge)?);
    let engine = Arc::new(SettlementEngine::new(
        settings.clone(),
        chain_manager.clone(),
        sender.clone(),
        quotes,
    ));

    let swap_api = Arc::new(OdosSwapClient::new(&settings.swap)?);
    let swaps = Arc::new(SwapOrchestrator::new(
        swap_api,
        chain_manager.clone(),
        sender,
        settings.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState::new(engine, swaps, chain_manager.clone())
            .with_job_retention(std::time::Duration::from_secs(config.job_retention_secs));
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let interval = settings.engine.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_manager.health_check().await;
                let mut all_healthy = true;
                for (chain, healthy) in health {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                        all_healthy = false;
                    }
                }

                metrics::record_health_check();
                if !all_healthy {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Settlement engine is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // In-flight bridge relays are not affected by stopping the daemon
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Settlement engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,settlement_engine=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
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
