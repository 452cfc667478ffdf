// =============================================================================
// Central Application State — candle relay
// =============================================================================
//
// Ties the subsystems together. Built once in main.rs, wrapped in `Arc` and
// handed to every task and HTTP handler; there is no global mutable state.
//
// Thread safety:
//   - The coordinator guards all open candles behind one mutex.
//   - The registry guards consumer subscriptions behind its own RwLock.
//   - The two locks are never held together.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::broadcast::{SubscriptionRegistry, UpdateBroadcaster};
use crate::market_data::AggregationCoordinator;
use crate::runtime_config::RuntimeConfig;
use crate::store::CandleStore;
use crate::types::{Candle, UpdateEvent};

/// Receiving halves of the pipelines leaving the coordinator. Each is consumed
/// by exactly one task.
pub struct Pipelines {
    /// Live and closed updates, for the broadcaster.
    pub events: mpsc::UnboundedReceiver<UpdateEvent>,
    /// Closed candles, for the persistence writer.
    pub closed: mpsc::UnboundedReceiver<Candle>,
}

/// Health payload for `/api/v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub consumers: usize,
    pub open_candles: usize,
    pub ticks_processed: u64,
    pub ticks_dropped: u64,
    pub candles_closed: u64,
}

pub struct AppState {
    pub config: RuntimeConfig,
    pub coordinator: Arc<AggregationCoordinator>,
    pub registry: Arc<SubscriptionRegistry>,
    pub store: Arc<dyn CandleStore>,
    pub start_time: Instant,
}

impl AppState {
    /// Construct the state and the channels that connect its tasks.
    pub fn new(config: RuntimeConfig, store: Arc<dyn CandleStore>) -> (Self, Pipelines) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let coordinator = Arc::new(AggregationCoordinator::new(&config, events_tx, closed_tx));
        let registry = Arc::new(SubscriptionRegistry::new(config.consumer_outbox_capacity));

        let state = Self {
            config,
            coordinator,
            registry,
            store,
            start_time: Instant::now(),
        };
        let pipelines = Pipelines {
            events: events_rx,
            closed: closed_rx,
        };
        (state, pipelines)
    }

    /// Broadcaster bound to this state's registry and coalescing interval.
    pub fn broadcaster(&self) -> UpdateBroadcaster {
        UpdateBroadcaster::new(self.registry.clone(), self.config.live_interval())
    }

    pub fn health(&self) -> HealthSnapshot {
        let stats = self.coordinator.stats();
        HealthSnapshot {
            status: "ok",
            uptime_secs: self.start_time.elapsed().as_secs(),
            consumers: self.registry.len(),
            open_candles: self.coordinator.open_snapshots().len(),
            ticks_processed: stats.ticks_processed,
            ticks_dropped: stats.ticks_dropped,
            candles_closed: stats.candles_closed,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{run_persistence_writer, MemoryCandleStore};
    use crate::types::{Tick, UpdateKind};
    use chrono::{TimeDelta, TimeZone, Utc};

    #[tokio::test]
    async fn tick_to_consumer_and_store_end_to_end() {
        let store = Arc::new(MemoryCandleStore::new());
        let (state, pipelines) = AppState::new(RuntimeConfig::default(), store.clone());

        let (id, mut outbox) = state.registry.register();
        state.registry.subscribe(id, "AAPL");

        let mut broadcaster = state.broadcaster();
        let base = Utc.with_ymd_and_hms(2024, 4, 2, 14, 0, 0).unwrap();
        for (secs, price) in [(0, 100.0), (20, 105.0), (40, 98.0), (50, 102.0), (61, 103.0)] {
            state
                .coordinator
                .process_tick(&Tick::new("AAPL", price, 1.0, base + TimeDelta::seconds(secs)));
        }

        let Pipelines { mut events, closed } = pipelines;
        while let Ok(ev) = events.try_recv() {
            broadcaster.handle_event(ev);
        }
        broadcaster.flush_pending();

        let first: UpdateEvent = serde_json::from_str(&outbox.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind, UpdateKind::Closed);
        assert_eq!(first.candle.open, 100.0);
        assert_eq!(first.candle.high, 105.0);
        assert_eq!(first.candle.low, 98.0);
        assert_eq!(first.candle.close, 102.0);
        assert!((first.candle.volume - 4.0).abs() < 1e-9);

        let second: UpdateEvent = serde_json::from_str(&outbox.recv().await.unwrap()).unwrap();
        assert_eq!(second.kind, UpdateKind::Live);
        assert_eq!(second.candle.open, 103.0);

        // Dropping the state closes the coordinator's senders, ending the writer.
        drop(state);
        run_persistence_writer(store.clone(), closed).await;
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn health_reflects_counters() {
        let (state, _pipelines) =
            AppState::new(RuntimeConfig::default(), Arc::new(MemoryCandleStore::new()));
        let (_id, _rx) = state.registry.register();
        let t = Utc.with_ymd_and_hms(2024, 4, 2, 14, 0, 0).unwrap();
        state.coordinator.process_tick(&Tick::new("AMZN", 10.0, 1.0, t));

        let health = state.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.consumers, 1);
        assert_eq!(health.open_candles, 1);
        assert_eq!(health.ticks_processed, 1);
        assert_eq!(health.candles_closed, 0);
    }
}
