// =============================================================================
// Subscription Registry — which consumer wants which symbol
// =============================================================================
//
// Each connected consumer owns a bounded outbox; the registry holds the sending
// half together with the consumer's current symbol. Lookups hand out clones of
// the matching outboxes, so delivery never happens under the registry lock and
// concurrent subscribe/unsubscribe can never invalidate an iteration.
//
// Removing an entry drops the registry's sender, which ends the consumer's
// outbox stream once it has drained.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub type ConsumerId = Uuid;

/// Serialized update payload, shared between all recipients of one delivery.
pub type Payload = Arc<str>;

struct ConsumerEntry {
    symbol: Option<String>,
    outbox: mpsc::Sender<Payload>,
}

pub struct SubscriptionRegistry {
    consumers: RwLock<HashMap<ConsumerId, ConsumerEntry>>,
    outbox_capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Register a newly connected consumer with no subscription yet.
    pub fn register(&self) -> (ConsumerId, mpsc::Receiver<Payload>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        self.consumers.write().insert(
            id,
            ConsumerEntry {
                symbol: None,
                outbox: tx,
            },
        );
        debug!(consumer = %id, "consumer registered");
        (id, rx)
    }

    /// Point `id` at `symbol`, replacing any earlier subscription.
    ///
    /// Returns `false` if the consumer is no longer registered.
    pub fn subscribe(&self, id: ConsumerId, symbol: &str) -> bool {
        let mut consumers = self.consumers.write();
        match consumers.get_mut(&id) {
            Some(entry) => {
                let previous = entry.symbol.replace(symbol.to_string());
                info!(
                    consumer = %id,
                    symbol = %symbol,
                    previous = ?previous,
                    "consumer subscribed"
                );
                true
            }
            None => false,
        }
    }

    /// Forget a consumer entirely. Safe to call more than once.
    pub fn unsubscribe(&self, id: ConsumerId) -> bool {
        let removed = self.consumers.write().remove(&id).is_some();
        if removed {
            info!(consumer = %id, "consumer unregistered");
        }
        removed
    }

    /// Outboxes of every consumer currently subscribed to `symbol`.
    pub fn matching(&self, symbol: &str) -> Vec<(ConsumerId, mpsc::Sender<Payload>)> {
        self.consumers
            .read()
            .iter()
            .filter(|(_, e)| e.symbol.as_deref() == Some(symbol))
            .map(|(id, e)| (*id, e.outbox.clone()))
            .collect()
    }

    pub fn subscription_of(&self, id: ConsumerId) -> Option<String> {
        self.consumers.read().get(&id).and_then(|e| e.symbol.clone())
    }

    /// Number of connected consumers.
    pub fn len(&self) -> usize {
        self.consumers.read().len()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("consumers", &self.len())
            .field("outbox_capacity", &self.outbox_capacity)
            .finish()
    }
}
