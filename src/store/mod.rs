// =============================================================================
// Candle Store — durable sink for closed candles plus the history read path
// =============================================================================
//
// The coordinator never calls a store directly. Closed candles travel over an
// unbounded channel to `run_persistence_writer`, which appends them in close
// order. A failed append is logged and the candle is skipped; updates to
// consumers have already gone out by then.
// =============================================================================

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::types::Candle;

pub use memory::MemoryCandleStore;
pub use postgres::PgCandleStore;

#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Store a closed candle. Storing the same `(symbol, bucket_start)` twice
    /// keeps the first copy.
    async fn append(&self, candle: &Candle) -> Result<()>;

    /// Candles of one symbol, ascending by bucket start.
    async fn candles_for(&self, symbol: &str) -> Result<Vec<Candle>>;

    /// Every stored candle, ascending by bucket start.
    async fn all_candles(&self) -> Result<Vec<Candle>>;
}

/// Drain closed candles into `store` until the channel closes.
pub async fn run_persistence_writer(
    store: Arc<dyn CandleStore>,
    mut closed: mpsc::UnboundedReceiver<Candle>,
) {
    info!("persistence writer running");
    while let Some(candle) = closed.recv().await {
        match store.append(&candle).await {
            Ok(()) => debug!(
                symbol = %candle.symbol,
                bucket_start = %candle.bucket_start,
                "candle persisted"
            ),
            Err(e) => error!(
                symbol = %candle.symbol,
                bucket_start = %candle.bucket_start,
                error = %e,
                "failed to persist candle"
            ),
        }
    }
    info!("closed-candle channel ended — persistence writer stopping");
}
