// =============================================================================
// Envelope Bot — Main Entry Point
// =============================================================================
//
// Boots against the paper broker by default; a live brokerage binding plugs
// in behind the same `BrokerAdapter` trait. State (watchlist, positions,
// pending orders, session flags) lives in a single JSON document and
// survives restarts — the coordinator's startup sync reconciles it with the
// brokerage before any decision runs.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod broker;
mod config_store;
mod context;
mod coordinator;
mod errors;
mod execution_handler;
mod market_data;
mod market_hours;
mod order_ledger;
mod position_store;
mod signal_engine;
mod ta;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{spawn_dispatcher, RateLimiter};
use crate::broker::{BrokerAdapter, PaperBroker};
use crate::config_store::ConfigStore;
use crate::context::TradingContext;
use crate::coordinator::TradingCoordinator;
use crate::market_hours::Clock;
use crate::types::canonical_code;

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
    info!("║        Envelope Bot — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let state_path =
        std::env::var("ENVELOPE_STATE_FILE").unwrap_or_else(|_| "trading_state.json".into());
    let config = Arc::new(ConfigStore::load(&state_path)?);

    // Watchlist override from the environment (comma-separated tickers).
    if let Ok(codes) = std::env::var("ENVELOPE_WATCHLIST") {
        for raw in codes.split(',') {
            let code = canonical_code(raw);
            if code.is_empty() {
                continue;
            }
            if let Err(e) = config.add_to_watchlist(&code, "") {
                warn!(code = %code, error = %e, "watchlist override entry skipped");
            }
        }
    }
    let watchlist = config.watchlist_codes();
    info!(count = watchlist.len(), "watchlist loaded");

    // ── 2. Broker session ────────────────────────────────────────────────
    // The paper broker stands in until a live binding is wired up.
    let broker: Arc<dyn BrokerAdapter> = Arc::new(PaperBroker::new());
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    broker.attach_events(event_tx);

    // ── 3. Dispatch queues & shared context ──────────────────────────────
    let limiter = Arc::new(RateLimiter::for_dispatch());
    let api = spawn_dispatcher(broker.clone(), limiter);
    let ctx = Arc::new(TradingContext::new(config, broker, api, Clock::Wall));

    // ── 4. Coordinator ───────────────────────────────────────────────────
    let coordinator = Arc::new(TradingCoordinator::new(ctx));
    coordinator.clone().start(event_rx).await?;

    info!("engine running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    coordinator.stop().await;

    info!("envelope bot shut down complete");
    Ok(())
}
