// =============================================================================
// SpreadScan — Main Entry Point
// =============================================================================
//
// Wires the coordinator, IV history store, scan engine, and API surface
// together, then waits for ctrl-c and drains in-flight tick tasks before
// exiting.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod chain;
mod config;
mod coordinator;
mod engine;
mod error;
mod filters;
mod gateway;
mod iv_history;
mod presets;
mod spreads;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::config::ScannerConfig;
use crate::coordinator::RequestCoordinator;
use crate::engine::ScanEngine;
use crate::gateway::HttpGateway;
use crate::iv_history::IvHistoryStore;
use crate::presets::PresetStore;

/// Daily closing IVs held per symbol by the background refresher.
const IV_REFRESH_LOOKBACK_DAYS: usize = 252;
/// Cadence of the IV history refresher.
const IV_REFRESH_INTERVAL_SECS: u64 = 15 * 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("SpreadScan starting up");

    let config_path =
        std::env::var("SPREADSCAN_CONFIG").unwrap_or_else(|_| "scanner_config.json".into());
    let mut config = ScannerConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        ScannerConfig::default()
    });

    // Env overrides for the external endpoints.
    if let Ok(url) = std::env::var("SPREADSCAN_GATEWAY_URL") {
        config.gateway_url = url;
    }
    if let Ok(url) = std::env::var("SPREADSCAN_IV_HISTORY_URL") {
        config.iv_history_url = url;
    }

    info!(
        workers = config.workers,
        max_concurrent = config.max_concurrent,
        gateway = %config.gateway_url,
        "scanner configured"
    );

    // ── 2. Upstream gateway & coordinator ────────────────────────────────
    let gateway = Arc::new(HttpGateway::new(config.gateway_url.clone()));
    let coordinator = RequestCoordinator::new(gateway, &config);
    coordinator.spawn();
    info!(
        workers = config.workers,
        queue = config.coordinator.queue_size,
        "request coordinator running"
    );

    // ── 3. IV history store & refresher ──────────────────────────────────
    let iv_history = Arc::new(IvHistoryStore::new(config.iv_history_url.clone()));

    // ── 4. Scan engine ───────────────────────────────────────────────────
    let engine = ScanEngine::new(coordinator, iv_history.clone(), config.clone());
    engine.spawn_tick_loop();
    info!("scan engine tick loop running");

    // The refresher pulls the live symbol universe from the engine so new
    // scans get history without a restart.
    {
        let engine = engine.clone();
        iv_history.spawn_refresher(IV_REFRESH_INTERVAL_SECS, IV_REFRESH_LOOKBACK_DAYS, move || {
            engine.all_symbols()
        });
    }

    // ── 5. Preset store ──────────────────────────────────────────────────
    let presets = Arc::new(PresetStore::open(config.preset_path.clone()));

    // ── 6. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("SPREADSCAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = Arc::new(ApiState::new(engine.clone(), presets, config.clone()));

    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("all subsystems running — press ctrl-c to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining");

    engine
        .drain(Duration::from_secs(config.drain_timeout_secs))
        .await;

    if let Err(e) = config.save(&config_path) {
        warn!(error = %e, "failed to save scanner config on shutdown");
    }

    info!("SpreadScan shut down complete");
    Ok(())
}
