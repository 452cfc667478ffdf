// =============================================================================
// Update Broadcaster — closed updates now, live updates coalesced
// =============================================================================
//
// Single consumer of the coordinator's event channel. Two delivery paths:
//
//   - Closed: serialized and pushed to every matching consumer immediately.
//   - Live:   stored as the pending update for its symbol, overwriting any
//             older one. Each coalescing tick delivers and clears all pending
//             updates, so a symbol gets at most one live delivery per interval
//             no matter how fast ticks arrive.
//
// Delivery is a non-blocking `try_send` into each consumer's outbox. A consumer
// whose outbox is full or closed is unregistered; nobody else is affected.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broadcast::registry::{Payload, SubscriptionRegistry};
use crate::types::{UpdateEvent, UpdateKind};

pub struct UpdateBroadcaster {
    registry: Arc<SubscriptionRegistry>,
    interval: Duration,
    /// Latest undelivered live update per symbol.
    pending: HashMap<String, UpdateEvent>,
}

impl UpdateBroadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            pending: HashMap::new(),
        }
    }

    /// Drive the coalescing loop until the event channel closes.
    ///
    /// Pending live updates are flushed once more before returning.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<UpdateEvent>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "update broadcaster running");

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            self.flush_pending();
                            info!("event channel closed — broadcaster stopping");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush_pending();
                }
            }
        }
    }

    /// Route one event: closed goes out now, live waits for the next tick.
    pub fn handle_event(&mut self, event: UpdateEvent) {
        match event.kind {
            UpdateKind::Closed => {
                // A live update of the bucket that just closed is stale.
                let stale = self
                    .pending
                    .get(event.symbol())
                    .is_some_and(|p| p.candle.bucket_start <= event.candle.bucket_start);
                if stale {
                    self.pending.remove(event.symbol());
                }
                self.deliver(&event);
            }
            UpdateKind::Live => {
                self.pending.insert(event.candle.symbol.clone(), event);
            }
        }
    }

    /// Deliver and clear every pending live update.
    pub fn flush_pending(&mut self) {
        for (_, event) in self.pending.drain() {
            Self::deliver_to(&self.registry, &event);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn deliver(&self, event: &UpdateEvent) -> usize {
        Self::deliver_to(&self.registry, event)
    }

    /// Push one event to all subscribers of its symbol. Returns the number of
    /// consumers that accepted it.
    fn deliver_to(registry: &SubscriptionRegistry, event: &UpdateEvent) -> usize {
        let targets = registry.matching(event.symbol());
        if targets.is_empty() {
            return 0;
        }

        let payload: Payload = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, symbol = %event.symbol(), "failed to serialise update");
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, outbox) in targets {
            match outbox.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(consumer = %id, kind = %event.kind, "consumer outbox full — disconnecting");
                    registry.unsubscribe(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(consumer = %id, "consumer already gone");
                    registry.unsubscribe(id);
                }
            }
        }

        debug!(
            symbol = %event.symbol(),
            kind = %event.kind,
            delivered,
            "update delivered"
        );
        delivered
    }
}
