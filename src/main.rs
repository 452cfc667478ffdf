// =============================================================================
// Candle Relay — Main Entry Point
// =============================================================================
//
// Aggregates trade ticks from the feed into fixed-width OHLCV candles, pushes
// live and closed candles to WebSocket consumers, and persists closed candles.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod market_data;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, Pipelines};
use crate::runtime_config::RuntimeConfig;
use crate::store::{CandleStore, MemoryCandleStore, PgCandleStore};

/// Upper bound on waiting for queued closed candles at shutdown.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle relay starting up");

    let config_path =
        std::env::var("CANDLE_RELAY_CONFIG").unwrap_or_else(|_| "candle_relay.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env()?;
    config.validate()?;

    if config.feed_api_key.is_empty() {
        warn!("No feed API key configured; the feed will likely reject the connection");
    }
    info!(
        symbols = ?config.symbols,
        bucket_secs = config.bucket_secs,
        live_interval_ms = config.live_interval_ms,
        late_tick_policy = %config.late_tick_policy,
        "Configuration ready"
    );

    // ── 2. Candle store ──────────────────────────────────────────────────
    let pg_store = match config.database_url.as_deref() {
        Some(url) => Some(PgCandleStore::connect(url, config.db_max_connections).await?),
        None => None,
    };
    let store: Arc<dyn CandleStore> = match &pg_store {
        Some(pg) => Arc::new(pg.clone()),
        None => {
            warn!("DATABASE_URL not set; closed candles are kept in memory only");
            Arc::new(MemoryCandleStore::new())
        }
    };

    // ── 3. Build shared state ────────────────────────────────────────────
    let (state, pipelines) = AppState::new(config, store.clone());
    let state = Arc::new(state);
    let Pipelines { events, closed } = pipelines;

    // ── 4. Broadcaster ───────────────────────────────────────────────────
    let broadcaster = state.broadcaster();
    tokio::spawn(broadcaster.run(events));

    // ── 5. Persistence writer ────────────────────────────────────────────
    let writer = tokio::spawn(store::run_persistence_writer(store, closed));

    // ── 6. Trade feed supervisor ─────────────────────────────────────────
    let feed_state = state.clone();
    let feed_task = tokio::spawn(async move {
        let delay = feed_state.config.feed_reconnect_delay();
        loop {
            if let Err(e) =
                market_data::feed::run_trade_feed(&feed_state.config, &feed_state.coordinator)
                    .await
            {
                error!(error = %e, delay_secs = delay.as_secs(), "Trade feed ended, reconnecting");
            }
            tokio::time::sleep(delay).await;
        }
    });

    // ── 7. Idle bucket sweeper ───────────────────────────────────────────
    let sweep_task = state.config.idle_close_grace().map(|grace| {
        let sweep_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_state.config.live_interval());
            loop {
                interval.tick().await;
                sweep_state.coordinator.close_idle(grace);
            }
        })
    });

    // ── 8. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping");

    let stats = state.coordinator.stats();
    info!(
        ticks_processed = stats.ticks_processed,
        ticks_dropped = stats.ticks_dropped,
        candles_closed = stats.candles_closed,
        "Final aggregation counters"
    );

    // Stop producing closed candles, then let the writer drain its queue.
    feed_task.abort();
    if let Some(task) = sweep_task {
        task.abort();
    }
    state.coordinator.close_persistence();
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(Ok(())) => info!("Persistence writer drained"),
        Ok(Err(e)) => error!(error = %e, "Persistence writer task failed"),
        Err(_) => warn!(
            timeout_secs = WRITER_DRAIN_TIMEOUT.as_secs(),
            "Persistence writer did not drain in time"
        ),
    }

    if let Some(pg) = pg_store {
        pg.close().await;
    }

    info!("Candle relay shut down complete.");
    Ok(())
}
