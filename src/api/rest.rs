// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`:
//
//   GET /api/v1/health           liveness + counters
//   GET /api/v1/candles?symbol=  stored candles of one symbol, oldest first
//   GET /api/v1/candles/history  stored candles grouped by symbol
//   GET /api/v1/candles/live     snapshots of the open buckets
//   GET /api/v1/ws               consumer WebSocket (see ws.rs)
//
// CORS is permissive; consumers are not authenticated.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::app_state::AppState;
use crate::types::Candle;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/candles", get(candles_for_symbol))
        .route("/api/v1/candles/history", get(candle_history))
        .route("/api/v1/candles/live", get(live_candles))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// Stored candles
// =============================================================================

#[derive(Deserialize)]
struct CandlesQuery {
    symbol: Option<String>,
}

async fn candles_for_symbol(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandlesQuery>,
) -> Response {
    let symbol = match query.symbol.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_uppercase(),
        _ => return error_response(StatusCode::BAD_REQUEST, "missing symbol parameter"),
    };

    match state.store.candles_for(&symbol).await {
        Ok(candles) => Json(candles).into_response(),
        Err(e) => {
            error!(symbol = %symbol, error = %e, "candle query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "candle query failed")
        }
    }
}

async fn candle_history(State(state): State<Arc<AppState>>) -> Response {
    match state.store.all_candles().await {
        Ok(candles) => Json(group_by_symbol(candles)).into_response(),
        Err(e) => {
            error!(error = %e, "candle history query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "candle history query failed")
        }
    }
}

/// Group candles by symbol, keeping each group's input order.
fn group_by_symbol(candles: Vec<Candle>) -> BTreeMap<String, Vec<Candle>> {
    let mut grouped: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    for candle in candles {
        grouped.entry(candle.symbol.clone()).or_default().push(candle);
    }
    grouped
}

// =============================================================================
// Open buckets
// =============================================================================

async fn live_candles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.open_snapshots())
}
