// =============================================================================
// Candle Builder — per-symbol OHLCV accumulator for one time bucket
// =============================================================================
//
// A builder is opened by the first tick of a bucket and folds every further
// tick of that bucket into open/high/low/close/volume. Buckets are half-open
// intervals `[start, start + width)` aligned to multiples of `width` since the
// Unix epoch, so a tick exactly on a boundary belongs to the next bucket.
// =============================================================================

use chrono::{DateTime, TimeDelta, Utc};

use crate::types::{Candle, Tick};

/// Floor `t` to the start of the bucket of the given width.
pub fn bucket_floor(t: DateTime<Utc>, width: TimeDelta) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let start_ms = t.timestamp_millis().div_euclid(width_ms) * width_ms;
    DateTime::from_timestamp_millis(start_ms).unwrap_or(t)
}

/// Mutable accumulator for the currently open bucket of one symbol.
#[derive(Debug, Clone)]
pub struct CandleBuilder {
    symbol: String,
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    tick_count: u64,
}

impl CandleBuilder {
    /// Open a new bucket from its first tick.
    ///
    /// The first tick is fully accounted for: it sets all four prices and the
    /// starting volume, so it must not also be passed to [`accept`].
    ///
    /// [`accept`]: CandleBuilder::accept
    pub fn start(first: &Tick, width: TimeDelta) -> Self {
        let bucket_start = bucket_floor(first.event_time, width);
        Self {
            symbol: first.symbol.clone(),
            bucket_start,
            bucket_end: bucket_start + width,
            open: first.price,
            high: first.price,
            low: first.price,
            close: first.price,
            volume: first.volume,
            tick_count: 1,
        }
    }

    /// Fold a tick into the open bucket.
    ///
    /// The caller decides bucket membership; this never rejects a tick.
    pub fn accept(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
        self.tick_count += 1;
    }

    /// Owned copy of the current state.
    pub fn snapshot(&self) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }

    /// `true` once `t` has reached the end of this bucket.
    pub fn is_rolled_over_by(&self, t: DateTime<Utc>) -> bool {
        t >= self.bucket_end
    }

    /// `true` if `t` is earlier than the start of this bucket.
    pub fn is_late(&self, t: DateTime<Utc>) -> bool {
        t < self.bucket_start
    }

    pub fn bucket_start(&self) -> DateTime<Utc> {
        self.bucket_start
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_end
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}
