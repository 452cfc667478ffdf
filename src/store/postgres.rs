// =============================================================================
// Postgres candle store (sqlx)
// =============================================================================
//
// One row per closed candle, primary key `(symbol, bucket_start)`. Appends use
// `ON CONFLICT DO NOTHING` so a replayed close cannot create a second row.
// The schema lives in `migrations/` and is applied on connect.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::store::CandleStore;
use crate::types::Candle;

#[derive(Clone)]
pub struct PgCandleStore {
    pool: PgPool,
}

impl PgCandleStore {
    /// Connect, then bring the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        info!(max_connections, "connecting to candle database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .context("failed to connect to candle database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run candle migrations")?;

        info!("candle database ready");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        info!("closing candle database pool");
        self.pool.close().await;
    }
}

fn map_candle_row(row: &PgRow) -> Result<Candle> {
    Ok(Candle {
        symbol: row.try_get("symbol")?,
        bucket_start: row.try_get("bucket_start")?,
        bucket_end: row.try_get("bucket_end")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
    })
}

#[async_trait]
impl CandleStore for PgCandleStore {
    async fn append(&self, candle: &Candle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO candles (symbol, bucket_start, bucket_end, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (symbol, bucket_start) DO NOTHING
            "#,
        )
        .bind(&candle.symbol)
        .bind(candle.bucket_start)
        .bind(candle.bucket_end)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert candle for {}", candle.symbol))?;
        Ok(())
    }

    async fn candles_for(&self, symbol: &str) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT symbol, bucket_start, bucket_end, open, high, low, close, volume
             FROM candles
             WHERE symbol = $1
             ORDER BY bucket_start ASC",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to query candles for {symbol}"))?;

        rows.iter().map(map_candle_row).collect()
    }

    async fn all_candles(&self) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT symbol, bucket_start, bucket_end, open, high, low, close, volume
             FROM candles
             ORDER BY bucket_start ASC, symbol ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to query candle history")?;

        rows.iter().map(map_candle_row).collect()
    }
}
