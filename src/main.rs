// =============================================================================
// Meridian Trade Engine — Main Entry Point
// =============================================================================
//
// Wires the reference collaborators (synthetic data source + paper broker)
// into the orchestrator and drives the tick loop until Ctrl+C. Swapping in a
// real data source or broker adapter is a matter of replacing the two Arcs
// handed to the orchestrator.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod automation;
mod broker;
mod bus;
mod config;
mod decision;
mod errors;
mod events;
mod indicators;
mod market;
mod orchestrator;
mod regime;
mod risk;
mod service;
mod services;
mod strategy;
#[cfg(test)]
mod testutil;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::PaperBroker;
use crate::config::SystemConfig;
use crate::market::SyntheticDataSource;
use crate::orchestrator::{Orchestrator, SymbolComponents};
use crate::services::JsonTpStore;
use crate::strategy::{LadderEntryManager, RegimeMomentumStrategy};

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Meridian Trade Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = SystemConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        SystemConfig::default()
    });
    config.apply_env_overrides();
    config.validate()?;

    info!(
        symbols = ?config.trading.symbols,
        timeframes = ?config.trading.timeframes,
        automation_enabled = config.automation.enabled,
        "configuration ready"
    );

    // ── 2. Reference collaborators ───────────────────────────────────────
    // The engine core only sees the DataSource / BrokerAdapter traits; the
    // synthetic source and paper broker make the binary self-contained.
    let source = Arc::new(SyntheticDataSource::new());
    let broker = Arc::new(PaperBroker::new());

    // ── 3. Per-symbol strategy components ────────────────────────────────
    let lead_timeframe = config.trading.timeframes[0].clone();
    let components: HashMap<String, SymbolComponents> = config
        .normalized_symbols()
        .into_iter()
        .map(|symbol| {
            let parts = SymbolComponents {
                strategy_engine: Arc::new(RegimeMomentumStrategy::new(
                    "regime-momentum",
                    lead_timeframe.clone(),
                )),
                entry_manager: Arc::new(LadderEntryManager::new(symbol.clone())),
                tp_store: Arc::new(JsonTpStore::new("config/tp_targets")),
            };
            (symbol, parts)
        })
        .collect();

    // ── 4. Build & start the orchestrator ────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        source,
        broker,
        components,
    )?);
    orchestrator.start()?;

    // ── 5. Drive the tick loop until Ctrl+C ──────────────────────────────
    let driver = orchestrator.clone();
    let loop_handle = tokio::spawn(async move { driver.run().await });

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    orchestrator.request_stop();
    if let Err(e) = loop_handle.await {
        error!(error = %e, "driver loop join failed");
    }
    orchestrator.stop().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Meridian Trade Engine shut down complete");
    Ok(())
}
