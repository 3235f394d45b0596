// =============================================================================
// Position Monitor Service — multi-target take profit + breakeven stops
// =============================================================================
//
// Tracks positions opened through `TradesExecuted` metadata. Each tracker
// carries an ordered TP ladder; on every `check_positions()` tick only the
// *next* unhit rung is evaluated (a price gap across several rungs still
// fills them one tick at a time, in order). A hit closes `percent` of the
// initial volume, optionally moves the stop to breakeven, and retires the
// tracker once the remaining volume falls below the broker minimum.
//
// Broker failures leave the rung unhit and the tracker untouched; the next
// tick retries. On start the monitor restores trackers for existing broker
// positions from the pluggable TP-target store, falling back to heuristic
// targets for strategy-tagged positions.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{normalize_volume, BrokerAdapter, MIN_LOT};
use crate::bus::EventBus;
use crate::decision::{Direction, TpTarget};
use crate::errors::ConfigError;
use crate::events::{Event, EventKind, EventPayload};
use crate::service::{HealthReport, Service, ServiceCore, ServiceState};

// ---------------------------------------------------------------------------
// TP target persistence
// ---------------------------------------------------------------------------

/// Pluggable per-ticket TP-ladder store used for restart recovery.
pub trait TpTargetStore: Send + Sync {
    fn save(&self, ticket: u64, targets: &[TpTarget]) -> Result<()>;

    fn load(&self, ticket: u64) -> Result<Option<Vec<TpTarget>>>;
}

/// Stateless default: persists nothing, restores nothing.
pub struct NullTpStore;

impl TpTargetStore for NullTpStore {
    fn save(&self, _ticket: u64, _targets: &[TpTarget]) -> Result<()> {
        Ok(())
    }

    fn load(&self, _ticket: u64) -> Result<Option<Vec<TpTarget>>> {
        Ok(None)
    }
}

/// JSON file per ticket with an atomic tmp+rename write.
pub struct JsonTpStore {
    dir: PathBuf,
}

impl JsonTpStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn ticket_path(&self, ticket: u64) -> PathBuf {
        self.dir.join(format!("tp_targets_{ticket}.json"))
    }
}

impl TpTargetStore for JsonTpStore {
    fn save(&self, ticket: u64, targets: &[TpTarget]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create tp store dir {}", self.dir.display()))?;
        let path = self.ticket_path(ticket);
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(serde_json::to_string_pretty(targets)?.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, ticket: u64) -> Result<Option<Vec<TpTarget>>> {
        let path = self.ticket_path(ticket);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// One monitored position.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub initial_volume: f64,
    pub remaining_volume: f64,
    pub open_price: f64,
    pub stop_loss: Option<f64>,
    pub tp_targets: Vec<TpTarget>,
    /// Indices of hit rungs; always a prefix of 0..tp_targets.len().
    pub hit_indices: Vec<usize>,
    pub magic: u64,
    pub group_id: Option<String>,
    pub closed: bool,
}

impl PositionTracker {
    fn next_unhit(&self) -> Option<(usize, TpTarget)> {
        let idx = self.hit_indices.len();
        self.tp_targets.get(idx).map(|t| (idx, *t))
    }

    fn is_hit(&self, level: f64, price: f64) -> bool {
        match self.direction {
            Direction::Long => price >= level,
            Direction::Short => price <= level,
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Configuration for the position monitor.
#[derive(Debug, Clone)]
pub struct PositionMonitorConfig {
    pub symbol: String,
    pub enable_tp_management: bool,
    pub enable_sl_management: bool,
}

impl PositionMonitorConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            enable_tp_management: true,
            enable_sl_management: true,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        Ok(())
    }
}

struct Inner {
    core: ServiceCore,
    cfg: PositionMonitorConfig,
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn TpTargetStore>,
    trackers: Mutex<HashMap<u64, PositionTracker>>,
}

/// Per-symbol position monitor.
pub struct PositionMonitorService {
    inner: Arc<Inner>,
}

impl PositionMonitorService {
    pub fn new(
        bus: Arc<EventBus>,
        broker: Arc<dyn BrokerAdapter>,
        store: Arc<dyn TpTargetStore>,
        cfg: PositionMonitorConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        info!(
            symbol = %cfg.symbol,
            tp_management = cfg.enable_tp_management,
            sl_management = cfg.enable_sl_management,
            "position monitor created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                core: ServiceCore::new(
                    format!("position-monitor-{}", cfg.symbol.to_lowercase()),
                    bus,
                ),
                cfg,
                broker,
                store,
                trackers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Evaluate the next TP rung of every tracked position against the
    /// current bid. Called periodically by the orchestrator.
    pub fn check_positions(&self) {
        Inner::check_positions(&self.inner);
    }

    pub fn tracked_count(&self) -> usize {
        self.inner
            .trackers
            .lock()
            .values()
            .filter(|t| !t.closed)
            .count()
    }

    pub fn tracker(&self, ticket: u64) -> Option<PositionTracker> {
        self.inner.trackers.lock().get(&ticket).cloned()
    }
}

impl Inner {
    fn on_trades_executed(inner: &Arc<Inner>, event: &Event) {
        inner.core.bump("events_received");

        let EventPayload::TradesExecuted {
            symbol, metadata, ..
        } = &event.payload
        else {
            return;
        };
        if *symbol != inner.cfg.symbol {
            return;
        }
        if metadata.tp_targets.is_empty() {
            debug!(symbol = %symbol, "no TP targets in metadata, nothing to monitor");
            return;
        }
        if metadata.tickets.is_empty() {
            warn!(symbol = %symbol, "trades executed without tickets");
            return;
        }

        let positions = match inner.broker.open_positions() {
            Ok(p) => p,
            Err(e) => {
                inner.core.record_error("fetch positions", &e);
                return;
            }
        };

        for &ticket in &metadata.tickets {
            let Some(info) = positions.iter().find(|p| p.ticket == ticket) else {
                warn!(ticket, "position not found at broker, cannot track");
                continue;
            };

            if let Err(e) = inner.store.save(ticket, &metadata.tp_targets) {
                warn!(ticket, error = %e, "failed to persist TP targets");
            }

            let tracker = PositionTracker {
                ticket,
                symbol: inner.cfg.symbol.clone(),
                direction: info.direction,
                initial_volume: info.volume,
                remaining_volume: info.volume,
                open_price: info.price_open,
                stop_loss: info.stop_loss,
                tp_targets: metadata.tp_targets.clone(),
                hit_indices: Vec::new(),
                magic: info.magic,
                group_id: metadata.group_id.clone(),
                closed: false,
            };

            info!(
                ticket,
                symbol = %inner.cfg.symbol,
                direction = %tracker.direction,
                volume = tracker.initial_volume,
                targets = tracker.tp_targets.len(),
                "position tracked"
            );
            inner.trackers.lock().insert(ticket, tracker);
            inner.core.bump("positions_monitored");
        }
    }

    fn check_positions(inner: &Arc<Inner>) {
        if !inner.core.is_running() || !inner.cfg.enable_tp_management {
            return;
        }
        if inner.trackers.lock().is_empty() {
            return;
        }

        let price = match inner.broker.symbol_price(&inner.cfg.symbol) {
            Ok(p) if p.bid > 0.0 => p.bid,
            Ok(_) => {
                debug!(symbol = %inner.cfg.symbol, "no valid bid, skipping check");
                return;
            }
            Err(e) => {
                inner.core.record_error("fetch price", &e);
                return;
            }
        };

        let tickets: Vec<u64> = inner.trackers.lock().keys().copied().collect();
        for ticket in tickets {
            Self::check_tracker(inner, ticket, price);
        }
    }

    fn check_tracker(inner: &Arc<Inner>, ticket: u64, price: f64) {
        // Snapshot the rung to evaluate without holding the lock across
        // broker calls.
        let Some((tracker, index, target)) = ({
            let trackers = inner.trackers.lock();
            trackers.get(&ticket).and_then(|t| {
                if t.closed {
                    return None;
                }
                t.next_unhit().map(|(i, target)| (t.clone(), i, target))
            })
        }) else {
            return;
        };

        if !tracker.is_hit(target.level, price) {
            return;
        }

        info!(
            ticket,
            level = target.level,
            price,
            rung = index + 1,
            "take profit level hit"
        );
        inner.core.publish(EventPayload::TpLevelHit {
            symbol: tracker.symbol.clone(),
            ticket,
            tp_level: target.level,
            current_price: price,
            percent_to_close: target.percent,
            move_stop: target.move_stop,
        });

        let volume_to_close = normalize_volume(target.percent / 100.0 * tracker.initial_volume)
            .min(tracker.remaining_volume);
        if volume_to_close <= 0.0 {
            // Degenerate rung (percent rounds below the lot grid): mark it
            // hit so the ladder can progress.
            warn!(ticket, percent = target.percent, "rung volume below lot grid");
            Self::mark_hit(inner, ticket, index, 0.0, price, &target);
            return;
        }

        match inner
            .broker
            .close_position(&tracker.symbol, ticket, Some(volume_to_close))
        {
            Ok(resp) if resp.is_done() => {
                Self::mark_hit(inner, ticket, index, volume_to_close, price, &target);
            }
            Ok(resp) => {
                // Rung stays unhit; retried next tick.
                error!(ticket, comment = %resp.comment, "partial close rejected");
            }
            Err(e) => {
                error!(ticket, error = %e, "partial close failed");
                inner.core.record_error("partial close", &e);
            }
        }
    }

    fn mark_hit(
        inner: &Arc<Inner>,
        ticket: u64,
        index: usize,
        closed_volume: f64,
        close_price: f64,
        target: &TpTarget,
    ) {
        inner.core.bump("tp_levels_hit");

        let (symbol, direction, open_price, old_stop, remaining, retired) = {
            let mut trackers = inner.trackers.lock();
            let Some(t) = trackers.get_mut(&ticket) else {
                return;
            };
            t.hit_indices.push(index);
            t.remaining_volume = (t.remaining_volume - closed_volume).max(0.0);
            // At or below the broker minimum nothing tradable remains.
            let retired = t.remaining_volume <= MIN_LOT + 1e-9;
            if retired {
                t.closed = true;
            }
            (
                t.symbol.clone(),
                t.direction,
                t.open_price,
                t.stop_loss,
                t.remaining_volume,
                retired,
            )
        };

        if closed_volume > 0.0 {
            let profit = match direction {
                Direction::Long => (close_price - open_price) * closed_volume,
                Direction::Short => (open_price - close_price) * closed_volume,
            };
            inner.core.publish(EventPayload::PositionPartiallyClosed {
                symbol: symbol.clone(),
                ticket,
                closed_volume,
                remaining_volume: remaining,
                close_price,
                profit,
                tp_level: target.level,
            });
            inner.core.bump("partial_closes_executed");
            info!(
                ticket,
                closed_volume,
                remaining,
                profit,
                "partial close executed"
            );
        }

        if target.move_stop && inner.cfg.enable_sl_management && !retired {
            Self::move_stop_to_breakeven(inner, ticket, &symbol, open_price, old_stop);
        }

        if retired {
            inner.trackers.lock().remove(&ticket);
            info!(ticket, "tracker retired: position fully closed");
        }
    }

    fn move_stop_to_breakeven(
        inner: &Arc<Inner>,
        ticket: u64,
        symbol: &str,
        open_price: f64,
        old_stop: Option<f64>,
    ) {
        match inner
            .broker
            .modify_position(symbol, ticket, Some(open_price), None)
        {
            Ok(resp) if resp.is_done() => {
                if let Some(t) = inner.trackers.lock().get_mut(&ticket) {
                    t.stop_loss = Some(open_price);
                }
                inner.core.publish(EventPayload::StopLossMoved {
                    symbol: symbol.to_string(),
                    ticket,
                    old_stop_loss: old_stop,
                    new_stop_loss: open_price,
                    reason: "tp_hit".to_string(),
                });
                inner.core.bump("stop_losses_moved");
                info!(ticket, new_stop = open_price, "stop moved to breakeven");
            }
            Ok(resp) => {
                error!(ticket, comment = %resp.comment, "stop move rejected");
            }
            Err(e) => {
                error!(ticket, error = %e, "stop move failed");
                inner.core.record_error("move stop", &e);
            }
        }
    }

    /// Rebuild trackers for broker positions found at start.
    fn restore_existing_positions(inner: &Arc<Inner>) {
        let positions = match inner.broker.open_positions() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "restore skipped: cannot list positions");
                return;
            }
        };

        let mut restored = 0usize;
        for info in positions.iter().filter(|p| p.symbol == inner.cfg.symbol) {
            let targets = match inner.store.load(info.ticket) {
                Ok(Some(targets)) => Some(targets),
                Ok(None) if info.magic != 0 => Some(Self::default_targets(info.price_open, info.direction)),
                Ok(None) => None,
                Err(e) => {
                    warn!(ticket = info.ticket, error = %e, "tp store load failed");
                    None
                }
            };

            let Some(targets) = targets else {
                warn!(
                    ticket = info.ticket,
                    "existing position without TP metadata, not TP-managed"
                );
                continue;
            };

            inner.trackers.lock().insert(
                info.ticket,
                PositionTracker {
                    ticket: info.ticket,
                    symbol: info.symbol.clone(),
                    direction: info.direction,
                    initial_volume: info.volume,
                    remaining_volume: info.volume,
                    open_price: info.price_open,
                    stop_loss: info.stop_loss,
                    tp_targets: targets,
                    hit_indices: Vec::new(),
                    magic: info.magic,
                    group_id: None,
                    closed: false,
                },
            );
            restored += 1;
            inner.core.bump("positions_monitored");
        }

        if restored > 0 {
            info!(restored, symbol = %inner.cfg.symbol, "restored position trackers");
        }
    }

    /// Conservative fallback ladder when no persisted targets exist.
    fn default_targets(open_price: f64, direction: Direction) -> Vec<TpTarget> {
        let (tp1, tp2) = match direction {
            Direction::Long => (open_price * 1.05, open_price * 1.15),
            Direction::Short => (open_price * 0.95, open_price * 0.85),
        };
        vec![
            TpTarget {
                level: tp1,
                percent: 80.0,
                move_stop: true,
            },
            TpTarget {
                level: tp2,
                percent: 20.0,
                move_stop: false,
            },
        ]
    }
}

impl Service for PositionMonitorService {
    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn start(&self) -> anyhow::Result<()> {
        self.inner.trackers.lock().clear();

        let handler_inner = Arc::clone(&self.inner);
        self.inner.core.subscribe(
            EventKind::TradesExecuted,
            Arc::new(move |event| {
                Inner::on_trades_executed(&handler_inner, event);
                Ok(())
            }),
        );

        self.inner.core.set_state(ServiceState::Running);
        Inner::restore_existing_positions(&self.inner);
        self.inner.core.log_started();
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.inner.core.release_subscriptions();
        self.inner.core.set_state(ServiceState::Stopped);
        self.inner.core.log_stopped();
        Ok(())
    }

    fn health_check(&self) -> HealthReport {
        self.inner.core.health("errors")
    }

    fn metrics(&self) -> std::collections::BTreeMap<String, u64> {
        self.inner.core.metrics_snapshot()
    }
}
