// =============================================================================
// In-memory candle store — used when no database is configured
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::store::CandleStore;
use crate::types::Candle;

/// Keyed by `(bucket_start, symbol)` so iteration is already in read order.
#[derive(Debug, Default)]
pub struct MemoryCandleStore {
    candles: RwLock<BTreeMap<(DateTime<Utc>, String), Candle>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.candles.read().len()
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn append(&self, candle: &Candle) -> Result<()> {
        self.candles
            .write()
            .entry((candle.bucket_start, candle.symbol.clone()))
            .or_insert_with(|| candle.clone());
        Ok(())
    }

    async fn candles_for(&self, symbol: &str) -> Result<Vec<Candle>> {
        Ok(self
            .candles
            .read()
            .values()
            .filter(|c| c.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn all_candles(&self) -> Result<Vec<Candle>> {
        Ok(self.candles.read().values().cloned().collect())
    }
}
