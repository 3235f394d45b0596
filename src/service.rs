// =============================================================================
// Service base — lifecycle, subscription bookkeeping, metrics, health
// =============================================================================
//
// Every pipeline service composes a `ServiceCore`: named state machine
// (initializing -> running -> stopped, error reachable from anywhere), the
// list of bus subscriptions it must release on stop, a string-keyed counter
// map, and the last recorded error. Handlers never re-throw; they record the
// error and keep the service running — a service only turns unhealthy when
// it is not running or its error counter reaches the threshold.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::bus::{EventBus, EventHandler};
use crate::events::{Event, EventKind, EventPayload};

/// Consecutive-error count at which a service reports unhealthy.
pub const ERROR_THRESHOLD: u64 = 10;

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initializing,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Health snapshot returned by `Service::health_check`.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub service_name: String,
    pub state: ServiceState,
    pub healthy: bool,
    pub uptime_seconds: f64,
    pub last_error: Option<String>,
    pub metrics: BTreeMap<String, u64>,
}

/// Common behaviour of every pipeline service.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Subscribe to events, initialise resources, transition to running.
    fn start(&self) -> anyhow::Result<()>;

    /// Release subscriptions and resources, transition to stopped. Must
    /// complete in bounded time.
    fn stop(&self) -> anyhow::Result<()>;

    fn health_check(&self) -> HealthReport;

    fn metrics(&self) -> BTreeMap<String, u64>;
}

/// Shared bookkeeping composed into each service.
pub struct ServiceCore {
    name: String,
    bus: Arc<EventBus>,
    state: RwLock<ServiceState>,
    started_at: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
    metrics: RwLock<BTreeMap<String, u64>>,
    subscriptions: Mutex<Vec<String>>,
}

impl ServiceCore {
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>) -> Self {
        // Common counters are always present, even before the first bump.
        let mut metrics = BTreeMap::new();
        for common in ["events_published", "events_received", "errors"] {
            metrics.insert(common.to_string(), 0);
        }
        Self {
            name: name.into(),
            bus,
            state: RwLock::new(ServiceState::Initializing),
            started_at: RwLock::new(None),
            last_error: RwLock::new(None),
            metrics: RwLock::new(metrics),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn set_state(&self, next: ServiceState) {
        let mut state = self.state.write();
        let old = *state;
        *state = next;
        drop(state);

        if next == ServiceState::Running && self.started_at.read().is_none() {
            *self.started_at.write() = Some(Instant::now());
        }
        debug!(service = %self.name, from = %old, to = %next, "service state changed");
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Subscribe on behalf of the service, recording the id for release.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> String {
        let id = self.bus.subscribe(kind, handler);
        self.subscriptions.lock().push(id.clone());
        id
    }

    /// Release every recorded subscription. Called from `stop()`.
    pub fn release_subscriptions(&self) {
        let ids: Vec<String> = self.subscriptions.lock().drain(..).collect();
        for id in ids {
            self.bus.unsubscribe(&id);
        }
    }

    // ── Publishing ──────────────────────────────────────────────────────

    /// Publish an event, counting it against this service.
    pub fn publish(&self, payload: EventPayload) {
        self.bus.publish(Event::new(payload));
        self.bump("events_published");
    }

    // ── Metrics & errors ────────────────────────────────────────────────

    pub fn bump(&self, metric: &str) {
        *self.metrics.write().entry(metric.to_string()).or_insert(0) += 1;
    }

    pub fn metric(&self, metric: &str) -> u64 {
        self.metrics.read().get(metric).copied().unwrap_or(0)
    }

    pub fn metrics_snapshot(&self) -> BTreeMap<String, u64> {
        self.metrics.read().clone()
    }

    /// Record a recoverable error: count it, remember it, keep running.
    pub fn record_error(&self, context: &str, err: &anyhow::Error) {
        self.bump("errors");
        *self.last_error.write() = Some(err.to_string());
        error!(service = %self.name, context, error = %err, "service error");
    }

    /// Record a fatal error and move the service into the error state.
    pub fn fail(&self, context: &str, err: &anyhow::Error) {
        self.record_error(context, err);
        self.set_state(ServiceState::Error);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at
            .read()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    // ── Health ──────────────────────────────────────────────────────────

    /// Build a health report. `error_metric` names the service-specific
    /// counter checked against [`ERROR_THRESHOLD`].
    pub fn health(&self, error_metric: &str) -> HealthReport {
        let state = self.state();
        let healthy = state == ServiceState::Running && self.metric(error_metric) < ERROR_THRESHOLD;
        HealthReport {
            service_name: self.name.clone(),
            state,
            healthy,
            uptime_seconds: self.uptime_seconds(),
            last_error: self.last_error(),
            metrics: self.metrics_snapshot(),
        }
    }

    /// Standard start/stop logging helpers.
    pub fn log_started(&self) {
        info!(service = %self.name, "service started");
    }

    pub fn log_stopped(&self) {
        info!(service = %self.name, "service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ServiceCore {
        ServiceCore::new("test-service", Arc::new(EventBus::default()))
    }

    #[test]
    fn initial_state() {
        let c = core();
        assert_eq!(c.state(), ServiceState::Initializing);
        assert!(!c.is_running());
        assert_eq!(c.uptime_seconds(), 0.0);
        // Common counters exist from the start.
        let metrics = c.metrics_snapshot();
        assert_eq!(metrics["events_published"], 0);
        assert_eq!(metrics["events_received"], 0);
        assert_eq!(metrics["errors"], 0);
    }

    #[test]
    fn running_sets_uptime_clock() {
        let c = core();
        c.set_state(ServiceState::Running);
        assert!(c.is_running());
        assert!(c.uptime_seconds() >= 0.0);
    }

    #[test]
    fn error_state_reachable_from_running() {
        let c = core();
        c.set_state(ServiceState::Running);
        c.fail("boom", &anyhow::anyhow!("fatal"));
        assert_eq!(c.state(), ServiceState::Error);
        assert_eq!(c.last_error().as_deref(), Some("fatal"));
    }

    #[test]
    fn record_error_keeps_running() {
        let c = core();
        c.set_state(ServiceState::Running);
        c.record_error("ctx", &anyhow::anyhow!("recoverable"));
        assert_eq!(c.state(), ServiceState::Running);
        assert_eq!(c.metric("errors"), 1);
    }

    #[test]
    fn health_threshold() {
        let c = core();
        c.set_state(ServiceState::Running);
        for _ in 0..ERROR_THRESHOLD - 1 {
            c.bump("fetch_errors");
        }
        assert!(c.health("fetch_errors").healthy);
        c.bump("fetch_errors");
        assert!(!c.health("fetch_errors").healthy);
    }

    #[test]
    fn health_unhealthy_when_not_running() {
        let c = core();
        assert!(!c.health("errors").healthy);
        c.set_state(ServiceState::Running);
        assert!(c.health("errors").healthy);
        c.set_state(ServiceState::Stopped);
        assert!(!c.health("errors").healthy);
    }

    #[test]
    fn subscriptions_released_once() {
        let bus = Arc::new(EventBus::default());
        let c = ServiceCore::new("svc", bus.clone());
        c.subscribe(EventKind::NewCandle, Arc::new(|_| Ok(())));
        c.subscribe(EventKind::DataFetched, Arc::new(|_| Ok(())));
        assert_eq!(bus.metrics().subscription_count, 2);

        c.release_subscriptions();
        assert_eq!(bus.metrics().subscription_count, 0);

        // Releasing again is a no-op.
        c.release_subscriptions();
    }

    #[test]
    fn publish_counts_against_service() {
        let c = core();
        c.publish(EventPayload::TradingAuthorized {
            symbol: "EURUSD".to_string(),
            reason: "x".to_string(),
        });
        assert_eq!(c.metric("events_published"), 1);
    }
}
