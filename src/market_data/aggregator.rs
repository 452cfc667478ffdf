// =============================================================================
// Aggregation Coordinator — routes ticks to per-symbol candle builders
// =============================================================================
//
// Owns exactly one open bucket per tracked symbol. Every tick is processed
// inside one mutex-guarded critical section:
//
//   1. No open bucket, or tick at/after the bucket end
//        -> finalize the previous bucket (persist + Closed event) and open a
//           new one from this tick.
//   2. Otherwise fold the tick into the open bucket.
//   3. Emit a Live event with the post-update snapshot.
//
// Events and closed candles leave through unbounded channels, so the critical
// section never waits on consumers or storage. Because both sends happen under
// the lock, a symbol's Closed event always precedes the Live events of its
// next bucket.
//
// Idle buckets are closed against the feed clock (the latest event time seen
// on any tracked symbol), never the server clock, so a feed running behind
// wall time cannot have its buckets closed under it.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::market_data::candle_builder::CandleBuilder;
use crate::runtime_config::RuntimeConfig;
use crate::types::{Candle, Tick, UpdateEvent};

// =============================================================================
// Late-tick policy
// =============================================================================

/// What to do with a tick older than the start of the open bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateTickPolicy {
    /// Fold it into the open bucket anyway.
    Accept,
    /// Discard it.
    Drop,
}

impl Default for LateTickPolicy {
    fn default() -> Self {
        Self::Accept
    }
}

impl std::fmt::Display for LateTickPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

impl std::str::FromStr for LateTickPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            other => anyhow::bail!("unknown late tick policy: {other}"),
        }
    }
}

// =============================================================================
// Outcome & stats
// =============================================================================

/// How a single tick was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// First tick of a symbol (or first after an idle close) opened a bucket.
    Opened,
    /// Folded into the open bucket.
    Accepted,
    /// Older than the open bucket, folded in under [`LateTickPolicy::Accept`].
    AcceptedLate,
    /// Closed the previous bucket and opened a new one.
    RolledOver,
    /// Discarded as late.
    DroppedLate,
    /// Symbol is not in the configured set.
    Untracked,
}

/// Counters surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregationStats {
    pub ticks_processed: u64,
    pub ticks_dropped: u64,
    pub candles_closed: u64,
}

/// Per-symbol aggregation state.
#[derive(Debug, Default)]
struct SymbolSlot {
    open: Option<CandleBuilder>,
    /// End of the most recently closed bucket; anything earlier is final.
    last_closed_end: Option<DateTime<Utc>>,
}

impl SymbolSlot {
    fn is_final(&self, t: DateTime<Utc>) -> bool {
        self.last_closed_end.is_some_and(|end| t < end)
    }
}

/// Everything guarded by the aggregation lock.
#[derive(Debug, Default)]
struct AggregationState {
    slots: HashMap<String, SymbolSlot>,
    /// Latest event time seen on the feed.
    feed_clock: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy)]
enum Step {
    Start,
    Roll,
    Accept,
    Late,
}

// =============================================================================
// AggregationCoordinator
// =============================================================================

pub struct AggregationCoordinator {
    symbols: HashSet<String>,
    bucket_width: TimeDelta,
    late_policy: LateTickPolicy,
    state: Mutex<AggregationState>,
    events: mpsc::UnboundedSender<UpdateEvent>,
    /// `None` once persistence has been closed for shutdown.
    persist: Mutex<Option<mpsc::UnboundedSender<Candle>>>,
    ticks_processed: AtomicU64,
    ticks_dropped: AtomicU64,
    candles_closed: AtomicU64,
}

impl AggregationCoordinator {
    /// Build a coordinator for the configured symbols.
    ///
    /// `events` feeds the update broadcaster; `persist` feeds the persistence
    /// writer with closed candles in close order.
    pub fn new(
        config: &RuntimeConfig,
        events: mpsc::UnboundedSender<UpdateEvent>,
        persist: mpsc::UnboundedSender<Candle>,
    ) -> Self {
        Self {
            symbols: config.symbols.iter().cloned().collect(),
            bucket_width: config.bucket_width(),
            late_policy: config.late_tick_policy,
            state: Mutex::new(AggregationState::default()),
            events,
            persist: Mutex::new(Some(persist)),
            ticks_processed: AtomicU64::new(0),
            ticks_dropped: AtomicU64::new(0),
            candles_closed: AtomicU64::new(0),
        }
    }

    /// Process one tick. See the module header for the algorithm.
    pub fn process_tick(&self, tick: &Tick) -> TickOutcome {
        if !self.symbols.contains(&tick.symbol) {
            debug!(symbol = %tick.symbol, "tick for untracked symbol ignored");
            return TickOutcome::Untracked;
        }

        let t = tick.event_time;
        let mut state = self.state.lock();
        state.feed_clock = Some(state.feed_clock.map_or(t, |c| c.max(t)));
        let slot = state.slots.entry(tick.symbol.clone()).or_default();

        let step = match &slot.open {
            None => Step::Start,
            Some(b) if b.is_rolled_over_by(t) => Step::Roll,
            Some(b) if b.is_late(t) => Step::Late,
            Some(_) => Step::Accept,
        };

        let outcome = match step {
            Step::Start | Step::Late if slot.is_final(t) => {
                return self.drop_late(tick);
            }
            Step::Start => {
                slot.open = Some(CandleBuilder::start(tick, self.bucket_width));
                TickOutcome::Opened
            }
            Step::Roll => {
                if let Some(prev) = slot.open.take() {
                    let closed = prev.snapshot();
                    slot.last_closed_end = Some(closed.bucket_end);
                    self.finalize(closed);
                }
                slot.open = Some(CandleBuilder::start(tick, self.bucket_width));
                TickOutcome::RolledOver
            }
            Step::Late if self.late_policy == LateTickPolicy::Drop => {
                return self.drop_late(tick);
            }
            Step::Late | Step::Accept => {
                if let Some(b) = slot.open.as_mut() {
                    b.accept(tick);
                }
                if matches!(step, Step::Late) {
                    TickOutcome::AcceptedLate
                } else {
                    TickOutcome::Accepted
                }
            }
        };

        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        if let Some(b) = slot.open.as_ref() {
            self.emit(UpdateEvent::live(b.snapshot()));
        }
        outcome
    }

    /// Close every open bucket whose end plus `grace` has been passed by the
    /// feed clock. Does nothing until the first tick arrives.
    ///
    /// Returns the number of buckets closed.
    pub fn close_idle(&self, grace: TimeDelta) -> usize {
        let mut state = self.state.lock();
        let Some(now) = state.feed_clock else {
            return 0;
        };
        let mut closed_count = 0;

        for slot in state.slots.values_mut() {
            let expired = slot
                .open
                .as_ref()
                .is_some_and(|b| now >= b.bucket_end() + grace);
            if !expired {
                continue;
            }
            if let Some(prev) = slot.open.take() {
                let closed = prev.snapshot();
                slot.last_closed_end = Some(closed.bucket_end);
                self.finalize(closed);
                closed_count += 1;
            }
        }

        closed_count
    }

    /// Latest event time seen on the feed.
    pub fn feed_clock(&self) -> Option<DateTime<Utc>> {
        self.state.lock().feed_clock
    }

    /// Stop handing closed candles to the persistence writer, letting it
    /// drain what is queued and finish. Candles closed afterwards are still
    /// broadcast but not stored.
    pub fn close_persistence(&self) {
        if self.persist.lock().take().is_some() {
            info!("persistence channel closed");
        }
    }

    /// Snapshots of all open buckets, ordered by symbol.
    pub fn open_snapshots(&self) -> Vec<Candle> {
        let state = self.state.lock();
        let mut out: Vec<Candle> = state
            .slots
            .values()
            .filter_map(|s| s.open.as_ref().map(CandleBuilder::snapshot))
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    pub fn stats(&self) -> AggregationStats {
        AggregationStats {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            candles_closed: self.candles_closed.load(Ordering::Relaxed),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Hand a closed candle to storage and announce it. Called under the lock.
    fn finalize(&self, closed: Candle) {
        info!(
            symbol = %closed.symbol,
            bucket_start = %closed.bucket_start,
            open = closed.open,
            high = closed.high,
            low = closed.low,
            close = closed.close,
            volume = closed.volume,
            "candle closed"
        );
        self.candles_closed.fetch_add(1, Ordering::Relaxed);

        let sent = self
            .persist
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(closed.clone()).is_ok());
        if !sent {
            error!(symbol = %closed.symbol, "persistence writer gone — closed candle not stored");
        }
        self.emit(UpdateEvent::closed(closed));
    }

    fn emit(&self, event: UpdateEvent) {
        if self.events.send(event).is_err() {
            debug!("broadcaster gone — update event discarded");
        }
    }

    fn drop_late(&self, tick: &Tick) -> TickOutcome {
        debug!(
            symbol = %tick.symbol,
            event_time = %tick.event_time,
            "late tick dropped"
        );
        self.ticks_dropped.fetch_add(1, Ordering::Relaxed);
        TickOutcome::DroppedLate
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateKind;
    use chrono::TimeZone;

    struct Harness {
        coordinator: AggregationCoordinator,
        events: mpsc::UnboundedReceiver<UpdateEvent>,
        persisted: mpsc::UnboundedReceiver<Candle>,
    }

    fn harness(policy: LateTickPolicy) -> Harness {
        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["AAPL".into(), "AMZN".into()];
        cfg.late_tick_policy = policy;
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (p_tx, p_rx) = mpsc::unbounded_channel();
        Harness {
            coordinator: AggregationCoordinator::new(&cfg, ev_tx, p_tx),
            events: ev_rx,
            persisted: p_rx,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 13, 30, 0).unwrap()
    }

    fn tick(sym: &str, secs: i64, price: f64, volume: f64) -> Tick {
        Tick::new(sym, price, volume, base() + TimeDelta::seconds(secs))
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(v) = rx.try_recv() {
            out.push(v);
        }
        out
    }

    #[test]
    fn single_bucket_scenario() {
        let mut h = harness(LateTickPolicy::Accept);
        let prices = [100.0, 105.0, 98.0, 102.0];
        let volumes = [1.0, 2.5, 3.0, 0.5];
        for (i, (p, v)) in prices.iter().zip(volumes).enumerate() {
            h.coordinator.process_tick(&tick("AAPL", i as i64 * 10, *p, v));
        }

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.kind == UpdateKind::Live));

        let last = &events[3].candle;
        assert_eq!(last.open, 100.0);
        assert_eq!(last.high, 105.0);
        assert_eq!(last.low, 98.0);
        assert_eq!(last.close, 102.0);
        assert!((last.volume - 7.0).abs() < 1e-9);
        assert!(drain(&mut h.persisted).is_empty());
    }

    #[test]
    fn rollover_closes_with_last_price_and_opens_with_new_tick() {
        let mut h = harness(LateTickPolicy::Accept);
        h.coordinator.process_tick(&tick("AAPL", 0, 100.0, 1.0));
        h.coordinator.process_tick(&tick("AAPL", 30, 101.0, 1.0));
        let outcome = h.coordinator.process_tick(&tick("AAPL", 65, 99.0, 2.0));
        assert_eq!(outcome, TickOutcome::RolledOver);

        let events = drain(&mut h.events);
        let kinds: Vec<UpdateKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                UpdateKind::Live,
                UpdateKind::Live,
                UpdateKind::Closed,
                UpdateKind::Live
            ]
        );

        let closed = &events[2].candle;
        assert_eq!(closed.close, 101.0);
        assert!((closed.volume - 2.0).abs() < 1e-9);

        let next = &events[3].candle;
        assert_eq!(next.open, 99.0);
        assert_eq!(next.bucket_start, closed.bucket_end);

        let persisted = drain(&mut h.persisted);
        assert_eq!(persisted, vec![closed.clone()]);
    }

    #[test]
    fn tick_on_bucket_end_belongs_to_next_bucket() {
        let mut h = harness(LateTickPolicy::Accept);
        h.coordinator.process_tick(&tick("AAPL", 0, 10.0, 1.0));
        assert_eq!(
            h.coordinator.process_tick(&tick("AAPL", 60, 11.0, 1.0)),
            TickOutcome::RolledOver
        );
        let persisted = drain(&mut h.persisted);
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].close, 10.0);
    }

    #[test]
    fn consecutive_buckets_are_contiguous_and_closed_once() {
        let mut h = harness(LateTickPolicy::Accept);
        for i in 0..10 {
            h.coordinator.process_tick(&tick("AAPL", i * 20, 100.0 + i as f64, 1.0));
        }
        let closed = drain(&mut h.persisted);
        // Ticks span four minutes; the last one is still open.
        assert_eq!(closed.len(), 3);
        for pair in closed.windows(2) {
            assert_eq!(pair[0].bucket_end, pair[1].bucket_start);
            assert!(pair[0].bucket_start < pair[1].bucket_start);
        }
        for c in &closed {
            assert_eq!(c.bucket_end - c.bucket_start, TimeDelta::seconds(60));
            assert!(c.low <= c.open.min(c.close));
            assert!(c.high >= c.open.max(c.close));
        }
        let closed_events = drain(&mut h.events)
            .into_iter()
            .filter(|e| e.kind == UpdateKind::Closed)
            .count();
        assert_eq!(closed_events, 3);
        assert_eq!(h.coordinator.stats().candles_closed, 3);
    }

    #[test]
    fn symbols_are_isolated() {
        let mut h = harness(LateTickPolicy::Accept);
        h.coordinator.process_tick(&tick("AAPL", 0, 100.0, 1.0));
        h.coordinator.process_tick(&tick("AMZN", 5, 3000.0, 1.0));
        h.coordinator.process_tick(&tick("AMZN", 70, 3010.0, 1.0));

        let persisted = drain(&mut h.persisted);
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].symbol, "AMZN");

        let open = h.coordinator.open_snapshots();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].symbol, "AAPL");
        assert_eq!(open[0].close, 100.0);
    }

    #[test]
    fn late_tick_accepted_into_current_bucket() {
        let mut h = harness(LateTickPolicy::Accept);
        h.coordinator.process_tick(&tick("AAPL", 61, 100.0, 1.0));
        let outcome = h.coordinator.process_tick(&tick("AAPL", 30, 90.0, 2.0));
        assert_eq!(outcome, TickOutcome::AcceptedLate);

        let open = h.coordinator.open_snapshots();
        assert_eq!(open[0].low, 90.0);
        assert_eq!(open[0].close, 90.0);
        assert!((open[0].volume - 3.0).abs() < 1e-9);
        assert_eq!(drain(&mut h.events).len(), 2);
    }

    #[test]
    fn late_tick_dropped_under_drop_policy() {
        let mut h = harness(LateTickPolicy::Drop);
        h.coordinator.process_tick(&tick("AAPL", 61, 100.0, 1.0));
        let outcome = h.coordinator.process_tick(&tick("AAPL", 30, 90.0, 2.0));
        assert_eq!(outcome, TickOutcome::DroppedLate);

        let open = h.coordinator.open_snapshots();
        assert_eq!(open[0].low, 100.0);
        assert_eq!(drain(&mut h.events).len(), 1);
        assert_eq!(h.coordinator.stats().ticks_dropped, 1);
    }

    #[test]
    fn untracked_symbol_ignored() {
        let mut h = harness(LateTickPolicy::Accept);
        assert_eq!(
            h.coordinator.process_tick(&tick("TSLA", 0, 1.0, 1.0)),
            TickOutcome::Untracked
        );
        assert!(drain(&mut h.events).is_empty());
        assert!(h.coordinator.open_snapshots().is_empty());
    }

    #[test]
    fn late_tick_for_closed_bucket_dropped_while_next_is_open() {
        let mut h = harness(LateTickPolicy::Accept);
        h.coordinator.process_tick(&tick("AAPL", 0, 100.0, 1.0));
        h.coordinator.process_tick(&tick("AAPL", 65, 101.0, 1.0));
        drain(&mut h.events);

        let outcome = h.coordinator.process_tick(&tick("AAPL", 30, 50.0, 7.0));
        assert_eq!(outcome, TickOutcome::DroppedLate);

        let open = h.coordinator.open_snapshots();
        assert_eq!(open[0].low, 101.0);
        assert_eq!(open[0].close, 101.0);
        assert!((open[0].volume - 1.0).abs() < 1e-9);
        assert!(drain(&mut h.events).is_empty());
        assert_eq!(h.coordinator.stats().ticks_dropped, 1);
    }

    #[test]
    fn idle_close_does_nothing_before_first_tick() {
        let h = harness(LateTickPolicy::Accept);
        assert_eq!(h.coordinator.close_idle(TimeDelta::zero()), 0);
        assert!(h.coordinator.feed_clock().is_none());
    }

    #[test]
    fn idle_close_never_cuts_off_in_order_ticks() {
        let mut h = harness(LateTickPolicy::Accept);
        let grace = TimeDelta::seconds(5);

        h.coordinator.process_tick(&tick("AAPL", 10, 100.0, 1.0));
        // However late the server clock runs, the feed is still inside the minute.
        assert_eq!(h.coordinator.close_idle(grace), 0);
        assert_eq!(
            h.coordinator.process_tick(&tick("AAPL", 20, 101.0, 2.0)),
            TickOutcome::Accepted
        );
        assert_eq!(h.coordinator.close_idle(grace), 0);
        assert_eq!(
            h.coordinator.process_tick(&tick("AAPL", 40, 102.0, 4.0)),
            TickOutcome::Accepted
        );
        h.coordinator.process_tick(&tick("AAPL", 61, 103.0, 1.0));

        let closed = drain(&mut h.persisted);
        assert_eq!(closed.len(), 1);
        assert!((closed[0].volume - 7.0).abs() < 1e-9);
        assert_eq!(h.coordinator.stats().ticks_dropped, 0);
    }

    #[test]
    fn idle_close_finalizes_once_and_rejects_ticks_for_closed_bucket() {
        let mut h = harness(LateTickPolicy::Accept);
        h.coordinator.process_tick(&tick("AAPL", 10, 100.0, 1.0));
        let grace = TimeDelta::seconds(5);

        // AMZN moves the feed clock; AAPL stays quiet.
        h.coordinator.process_tick(&tick("AMZN", 62, 3000.0, 1.0));
        assert_eq!(h.coordinator.close_idle(grace), 0);
        h.coordinator.process_tick(&tick("AMZN", 65, 3001.0, 1.0));
        assert_eq!(h.coordinator.feed_clock(), Some(base() + TimeDelta::seconds(65)));
        assert_eq!(h.coordinator.close_idle(grace), 1);
        assert_eq!(h.coordinator.close_idle(grace), 0);
        let closed = drain(&mut h.persisted);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].symbol, "AAPL");

        // A straggler for the already closed minute is discarded.
        assert_eq!(
            h.coordinator.process_tick(&tick("AAPL", 50, 101.0, 1.0)),
            TickOutcome::DroppedLate
        );
        // The next minute opens normally.
        assert_eq!(
            h.coordinator.process_tick(&tick("AAPL", 70, 102.0, 1.0)),
            TickOutcome::Opened
        );
        assert!(drain(&mut h.persisted).is_empty());
    }

    #[tokio::test]
    async fn close_persistence_ends_writer_after_queued_candles() {
        let mut h = harness(LateTickPolicy::Accept);
        h.coordinator.process_tick(&tick("AAPL", 0, 100.0, 1.0));
        h.coordinator.process_tick(&tick("AAPL", 61, 101.0, 1.0));
        h.coordinator.close_persistence();
        h.coordinator.close_persistence();

        // Closes after shutdown still reach consumers.
        h.coordinator.process_tick(&tick("AAPL", 125, 102.0, 1.0));
        let closed_events = drain(&mut h.events)
            .into_iter()
            .filter(|e| e.kind == UpdateKind::Closed)
            .count();
        assert_eq!(closed_events, 2);

        assert_eq!(h.persisted.recv().await.map(|c| c.close), Some(100.0));
        assert!(h.persisted.recv().await.is_none());
    }

    #[test]
    fn late_tick_policy_parses() {
        assert_eq!("drop".parse::<LateTickPolicy>().unwrap(), LateTickPolicy::Drop);
        assert_eq!(" Accept ".parse::<LateTickPolicy>().unwrap(), LateTickPolicy::Accept);
        assert!("maybe".parse::<LateTickPolicy>().is_err());
    }
}
