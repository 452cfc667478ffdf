// =============================================================================
// WebSocket Handler — per-consumer candle updates
// =============================================================================
//
// Consumers connect to `/api/v1/ws` and are registered with no subscription.
// Any text frame selects the symbol to follow, either as a bare symbol
// (`AAPL`) or as `{"symbol":"AAPL"}`; a later frame replaces the earlier one.
//
// Outbound frames are the JSON-encoded updates queued by the broadcaster:
//   {"updateType":"live"|"closed","candle":{...}}
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Disconnects when the broadcaster drops a consumer that fell behind.
//   - Removes the consumer from the registry on every exit path.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Longest symbol accepted from a consumer.
const MAX_SYMBOL_LEN: usize = 32;

// =============================================================================
// Subscribe frames
// =============================================================================

#[derive(Deserialize)]
struct SubscribeRequest {
    symbol: String,
}

/// Extract the requested symbol from a consumer text frame.
///
/// The result is trimmed and upper-cased.
pub fn parse_subscribe(text: &str) -> Result<String> {
    let trimmed = text.trim();
    let raw = if trimmed.starts_with('{') {
        serde_json::from_str::<SubscribeRequest>(trimmed)?.symbol
    } else {
        trimmed.to_string()
    };

    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        bail!("empty symbol");
    }
    if symbol.len() > MAX_SYMBOL_LEN {
        bail!("symbol longer than {MAX_SYMBOL_LEN} characters");
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_' | '/'))
    {
        bail!("symbol contains unsupported characters");
    }
    Ok(symbol)
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_consumer(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single consumer connection.
///
/// Runs two branches via `tokio::select!`:
///   1. **Push** — forward payloads queued in the consumer's outbox.
///   2. **Recv** — process subscribe frames, Ping and Close.
async fn handle_consumer(socket: WebSocket, state: Arc<AppState>) {
    let (id, mut outbox) = state.registry.register();
    let (mut sender, mut receiver) = socket.split();
    info!(consumer = %id, "consumer connected");

    loop {
        tokio::select! {
            // ── Push: outbound updates ──────────────────────────────────
            queued = outbox.recv() => {
                match queued {
                    Some(payload) => {
                        if let Err(e) = sender.send(Message::Text(payload.to_string())).await {
                            debug!(consumer = %id, error = %e, "send failed, disconnecting");
                            break;
                        }
                    }
                    None => {
                        warn!(consumer = %id, "consumer dropped by broadcaster");
                        break;
                    }
                }
            }

            // ── Recv: consumer frames ───────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_subscribe(&text) {
                        Ok(symbol) => {
                            if !state.config.symbols.contains(&symbol) {
                                warn!(consumer = %id, symbol = %symbol, "subscribed to a symbol the feed does not carry");
                            }
                            state.registry.subscribe(id, &symbol);
                        }
                        Err(e) => {
                            warn!(consumer = %id, error = %e, "ignoring invalid subscribe frame");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(consumer = %id, error = %e, "failed to send Pong");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(consumer = %id, "close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(consumer = %id, error = %e, "receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.registry.unsubscribe(id);
    let _ = sender.close().await;
    info!(consumer = %id, "consumer disconnected");
}
