// =============================================================================
// Event Bus — synchronous in-process publish/subscribe
// =============================================================================
//
// Services communicate only through events: no service holds a reference to
// another. Delivery is synchronous fan-out on the publishing thread, in
// subscription order. A failing handler is recorded and skipped; the rest of
// the fan-out continues and the error never reaches `publish`'s caller.
//
// `publish` snapshots the subscriber list before dispatching, so handlers may
// subscribe, unsubscribe, or publish again mid-fan-out without invalidating
// the in-progress delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::events::{Event, EventKind};

/// Handler invoked for every event of the subscribed kind. Returning `Err`
/// counts as a handler failure; it is logged and isolated.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Point-in-time bus metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMetrics {
    pub events_published: u64,
    pub events_delivered: u64,
    pub handler_errors: u64,
    pub subscription_count: usize,
    pub event_history_size: usize,
    pub event_types_subscribed: usize,
}

/// Central event bus shared by all services of the engine.
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventKind, Vec<(String, EventHandler)>>>,
    history: Mutex<VecDeque<Event>>,
    history_limit: usize,
    log_all_events: bool,

    subscription_counter: AtomicU64,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    handler_errors: AtomicU64,
}

impl EventBus {
    pub fn new(history_limit: usize, log_all_events: bool) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_limit.min(1024))),
            history_limit,
            log_all_events,
            subscription_counter: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }
    }

    /// Subscribe a handler to one event kind; returns the subscription id.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> String {
        let n = self.subscription_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("sub_{n}_{kind}");

        let mut subs = self.subscriptions.write();
        let list = subs.entry(kind).or_default();
        list.push((id.clone(), handler));
        debug!(subscription = %id, subscribers = list.len(), "subscribed");
        id
    }

    /// Remove a subscription. Returns false when the id is unknown.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subs = self.subscriptions.write();
        for list in subs.values_mut() {
            if let Some(pos) = list.iter().position(|(id, _)| id == subscription_id) {
                list.remove(pos);
                debug!(subscription = %subscription_id, "unsubscribed");
                return true;
            }
        }
        warn!(subscription = %subscription_id, "unsubscribe: subscription not found");
        false
    }

    /// Publish an event: record it in history, then deliver synchronously to
    /// every subscriber of its kind, in subscription order.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();

        if self.log_all_events {
            debug!(kind = %kind, event_id = %event.event_id, "publishing");
        }

        if self.history_limit > 0 {
            let mut history = self.history.lock();
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        self.events_published.fetch_add(1, Ordering::Relaxed);

        // Snapshot the handlers so concurrent subscribe/unsubscribe (and
        // re-entrant publishes from inside handlers) cannot disturb this
        // fan-out.
        let handlers: Vec<(String, EventHandler)> = {
            let subs = self.subscriptions.read();
            match subs.get(&kind) {
                Some(list) => list.clone(),
                None => {
                    debug!(kind = %kind, "no subscribers");
                    return;
                }
            }
        };

        for (subscription_id, handler) in handlers {
            match handler(&event) {
                Ok(()) => {
                    self.events_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        subscription = %subscription_id,
                        kind = %kind,
                        error = %e,
                        "event handler failed"
                    );
                }
            }
        }
    }

    /// Number of subscribers for one kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .get(&kind)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Event history, optionally filtered by kind, optionally limited to the
    /// most recent `limit` entries.
    pub fn history(&self, kind: Option<EventKind>, limit: Option<usize>) -> Vec<Event> {
        let history = self.history.lock();
        let mut events: Vec<Event> = match kind {
            Some(k) => history.iter().filter(|e| e.kind() == k).cloned().collect(),
            None => history.iter().cloned().collect(),
        };
        if let Some(n) = limit {
            if events.len() > n {
                events.drain(..events.len() - n);
            }
        }
        events
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
        debug!("event history cleared");
    }

    /// Drop every subscription. Test support.
    pub fn clear_subscriptions(&self) {
        self.subscriptions.write().clear();
    }

    pub fn metrics(&self) -> BusMetrics {
        let subs = self.subscriptions.read();
        BusMetrics {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            subscription_count: subs.values().map(|l| l.len()).sum(),
            event_history_size: self.history.lock().len(),
            event_types_subscribed: subs.values().filter(|l| !l.is_empty()).count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000, false)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.metrics();
        f.debug_struct("EventBus")
            .field("subscriptions", &m.subscription_count)
            .field("events_published", &m.events_published)
            .field("history_size", &m.event_history_size)
            .finish()
    }
}
