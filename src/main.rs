// =============================================================================
// Vanta Exit Sentinel — Main Entry Point
// =============================================================================
//
// Autonomous exit management for open token positions: risk-scaled sizing,
// push + poll price ingest, per-position trigger evaluation, and retried swap
// execution with durable position snapshots.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod config;
mod dispatch;
mod error;
mod evaluator;
mod ingest;
mod monitor;
mod notify;
mod oracle;
mod persist;
mod registry;
mod sizing;
mod state;
mod swap;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::oracle::HttpPriceOracle;
use crate::state::EngineState;
use crate::swap::HttpSwapClient;

const CONFIG_PATH: &str = "vanta_config.json";

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
    info!("║        Vanta Exit Sentinel — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // First run: write the defaults out so the operator has a file to edit.
    if !std::path::Path::new(CONFIG_PATH).exists() {
        if let Err(e) = config.save(CONFIG_PATH) {
            warn!(error = %e, "Failed to write default config file");
        }
    }

    config.apply_env_overrides();
    config.validate()?;

    info!(
        bind_addr = %config.bind_addr,
        oracle_url = %config.oracle_url,
        swap_url = %config.swap_url,
        poll_interval_secs = config.poll_interval_secs,
        "Engine configured"
    );

    // ── 2. Build shared state & services ─────────────────────────────────
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let oracle = Arc::new(HttpPriceOracle::new(config.oracle_url.clone(), timeout));
    let swap = Arc::new(HttpSwapClient::new(config.swap_url.clone(), timeout));

    let state = Arc::new(EngineState::new(config));
    let dispatcher = Arc::new(Dispatcher::new(state.clone(), swap));

    // ── 3. Restore positions from the durable snapshot ───────────────────
    match state.store.load() {
        Ok(positions) => {
            let mut restored_active = 0usize;
            for position in positions {
                let id = position.id;
                let mint = position.mint.clone();
                let active = position.active;
                if let Err(e) = state.registry.insert_restored(position) {
                    warn!(id = %id, error = %e, "Skipping restored position");
                    continue;
                }
                if active {
                    monitor::launch_position(&state, &dispatcher, &oracle, id, mint);
                    restored_active += 1;
                }
            }
            info!(restored_active, "Snapshot restore complete");
        }
        Err(e) => {
            // Start with an empty book rather than refusing to run; the
            // broken snapshot file stays on disk for inspection.
            error!(error = %e, "Failed to load position snapshot — starting empty");
        }
    }

    // ── 4. Spawn the HTTP server ─────────────────────────────────────────
    let ctx = ApiContext {
        state: state.clone(),
        dispatcher,
        oracle,
    };
    let app = api::router(ctx);
    let bind_addr = state.config.read().bind_addr.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(bind_addr = %bind_addr, error = %e, "Failed to bind API listener");
                return;
            }
        };
        info!(bind_addr = %bind_addr, "API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    });

    // ── 5. Periodic snapshot timer ───────────────────────────────────────
    {
        let state = state.clone();
        let interval_secs = state.config.read().snapshot_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                state.persist_positions();
            }
        });
    }

    // ── 6. Run until shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received — persisting positions");
    state.persist_positions();
    info!("Goodbye");
    Ok(())
}
