// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single trade event from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub event_time: DateTime<Utc>,
}

impl Tick {
    pub fn new(
        symbol: impl Into<String>,
        price: f64,
        volume: f64,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            event_time,
        }
    }
}

/// OHLCV summary over the half-open interval `[bucket_start, bucket_end)`.
///
/// Timestamps travel as epoch milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub bucket_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub bucket_end: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Whether an update carries an in-progress or a final candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Live,
    Closed,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// An update pushed from the aggregation path to the broadcaster.
///
/// `candle` is always an owned snapshot, never a view into open state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    #[serde(rename = "updateType")]
    pub kind: UpdateKind,
    pub candle: Candle,
}

impl UpdateEvent {
    pub fn live(candle: Candle) -> Self {
        Self {
            kind: UpdateKind::Live,
            candle,
        }
    }

    pub fn closed(candle: Candle) -> Self {
        Self {
            kind: UpdateKind::Closed,
            candle,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.candle.symbol
    }
}
