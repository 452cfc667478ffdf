// =============================================================================
// Trade Feed — Finnhub-style trade WebSocket into the aggregation coordinator
// =============================================================================
//
// Connects to `{feed_url}?token={api_key}`, subscribes every configured symbol,
// then turns each `trade` frame into ticks in array order. A malformed frame is
// logged and skipped. Losing the connection ends the call with an error so the
// supervisor loop in main.rs can decide when to reconnect.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::market_data::AggregationCoordinator;
use crate::runtime_config::RuntimeConfig;
use crate::types::Tick;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<RawTrade>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "v")]
    volume: f64,
    /// Epoch milliseconds.
    #[serde(rename = "t")]
    timestamp: i64,
}

/// A decoded feed frame.
#[derive(Debug, PartialEq)]
pub enum FeedFrame {
    Trades(Vec<Tick>),
    Ping,
    /// Provider-reported error (bad token, unknown symbol, ...).
    Error(String),
    /// Any other frame type; carried for logging only.
    Other(String),
}

/// Decode one text frame from the feed.
///
/// ```json
/// { "type": "trade", "data": [ { "s": "AAPL", "p": 187.3, "v": 12, "t": 1700000000000 } ] }
/// ```
pub fn parse_feed_message(text: &str) -> Result<FeedFrame> {
    let frame: RawFrame = serde_json::from_str(text).context("failed to parse feed frame")?;

    match frame.kind.as_str() {
        "trade" => {
            let ticks = frame
                .data
                .into_iter()
                .map(|t| {
                    let event_time = DateTime::<Utc>::from_timestamp_millis(t.timestamp)
                        .with_context(|| format!("trade timestamp out of range: {}", t.timestamp))?;
                    Ok(Tick::new(t.symbol, t.price, t.volume, event_time))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(FeedFrame::Trades(ticks))
        }
        "ping" => Ok(FeedFrame::Ping),
        "error" => Ok(FeedFrame::Error(frame.msg.unwrap_or_default())),
        other => Ok(FeedFrame::Other(other.to_string())),
    }
}

/// Subscription frame sent once per symbol after connecting.
fn subscribe_frame(symbol: &str) -> String {
    serde_json::json!({ "type": "subscribe", "symbol": symbol }).to_string()
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Run one feed session until the connection is lost.
///
/// Always returns an error describing why the session ended.
pub async fn run_trade_feed(
    config: &RuntimeConfig,
    coordinator: &Arc<AggregationCoordinator>,
) -> Result<()> {
    let url = format!("{}?token={}", config.feed_url, config.feed_api_key);
    info!(url = %config.feed_url, symbols = ?config.symbols, "connecting to trade feed");

    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .context("failed to connect to trade feed")?;

    info!("trade feed connected");
    let (mut write, mut read) = ws_stream.split();

    for symbol in &config.symbols {
        write
            .send(Message::Text(subscribe_frame(symbol)))
            .await
            .with_context(|| format!("failed to subscribe {symbol} on trade feed"))?;
        debug!(symbol = %symbol, "feed subscription sent");
    }

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_feed_message(&text) {
                Ok(FeedFrame::Trades(ticks)) => {
                    for tick in &ticks {
                        coordinator.process_tick(tick);
                    }
                }
                Ok(FeedFrame::Ping) => {}
                Ok(FeedFrame::Error(msg)) => {
                    warn!(msg = %msg, "trade feed reported an error");
                }
                Ok(FeedFrame::Other(kind)) => {
                    debug!(kind = %kind, "unhandled feed frame type");
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed feed frame");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                anyhow::bail!("trade feed closed by provider: {frame:?}");
            }
            // Ping / Pong / Binary: tungstenite answers pings on its own.
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e).context("trade feed read error"),
            None => anyhow::bail!("trade feed stream ended"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trade_frame_keeps_order() {
        let json = r#"{
            "type": "trade",
            "data": [
                { "s": "AAPL", "p": 187.25, "v": 10, "t": 1700000000000, "c": ["1"] },
                { "s": "AMZN", "p": 143.5, "v": 2.5, "t": 1700000000500 }
            ]
        }"#;
        let frame = parse_feed_message(json).expect("should parse");
        let ticks = match frame {
            FeedFrame::Trades(ticks) => ticks,
            other => panic!("expected trades, got {other:?}"),
        };
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].symbol, "AAPL");
        assert!((ticks[0].price - 187.25).abs() < 1e-9);
        assert!((ticks[0].volume - 10.0).abs() < 1e-9);
        assert_eq!(ticks[0].event_time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(ticks[1].symbol, "AMZN");
    }

    #[test]
    fn parse_ping_and_error_frames() {
        assert_eq!(parse_feed_message(r#"{"type":"ping"}"#).unwrap(), FeedFrame::Ping);
        assert_eq!(
            parse_feed_message(r#"{"type":"error","msg":"Invalid token"}"#).unwrap(),
            FeedFrame::Error("Invalid token".into())
        );
        assert_eq!(
            parse_feed_message(r#"{"type":"news"}"#).unwrap(),
            FeedFrame::Other("news".into())
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(parse_feed_message("not json").is_err());
        assert!(parse_feed_message(r#"{"type":"trade","data":[{"s":"AAPL"}]}"#).is_err());
    }

    #[test]
    fn subscribe_frame_shape() {
        let v: serde_json::Value = serde_json::from_str(&subscribe_frame("AAPL")).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["symbol"], "AAPL");
    }
}
