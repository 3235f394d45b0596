// =============================================================================
// Trade Execution Service — decision batches to broker orders
// =============================================================================
//
// Consumes `TradesReady` batches for its symbol. Entries are gated on the
// automation flag (disabled => `OrderRejected{automation_disabled}` per
// entry, exits continue). The surviving batch goes through the broker's
// trading cycle; the returned context drives `TradingAuthorized` /
// `TradingBlocked` / `RiskLimitBreached`, and the fill report drives
// `OrderPlaced`, `PositionClosed`, and one `TradesExecuted` per executed
// entry decision — whose metadata tickets feed the position monitor.
//
// Two execution modes: `immediate` runs every batch on arrival; `batch`
// accumulates until `batch_size` batches are pending, flushing the backlog
// then and on stop.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::automation::AutomationStateManager;
use crate::broker::{BrokerAdapter, CycleReport};
use crate::bus::EventBus;
use crate::decision::Trades;
use crate::errors::ConfigError;
use crate::events::{Event, EventKind, EventPayload, TradeMetadata};
use crate::service::{HealthReport, Service, ServiceCore, ServiceState};

/// Execution scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Immediate,
    Batch,
}

/// Configuration for the execution service.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub symbol: String,
    pub mode: ExecutionMode,
    /// Pending batches that trigger a flush in batch mode.
    pub batch_size: usize,
}

impl ExecutionConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            mode: ExecutionMode::Immediate,
            batch_size: 1,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.batch_size < 1 {
            return Err(ConfigError::invalid("batch_size", "must be >= 1"));
        }
        Ok(())
    }
}

struct Inner {
    core: ServiceCore,
    cfg: ExecutionConfig,
    broker: Arc<dyn BrokerAdapter>,
    automation: Option<Arc<AutomationStateManager>>,
    pending: Mutex<Vec<Trades>>,
}

/// Per-symbol trade executor.
pub struct ExecutionService {
    inner: Arc<Inner>,
}

impl ExecutionService {
    pub fn new(
        bus: Arc<EventBus>,
        broker: Arc<dyn BrokerAdapter>,
        automation: Option<Arc<AutomationStateManager>>,
        cfg: ExecutionConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        info!(
            symbol = %cfg.symbol,
            mode = ?cfg.mode,
            batch_size = cfg.batch_size,
            "execution service created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                core: ServiceCore::new(format!("execution-{}", cfg.symbol.to_lowercase()), bus),
                cfg,
                broker,
                automation,
                pending: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn pending_batches(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Inner {
    fn on_trades_ready(inner: &Arc<Inner>, event: &Event) {
        inner.core.bump("events_received");

        let EventPayload::TradesReady { symbol, trades, .. } = &event.payload else {
            return;
        };
        if *symbol != inner.cfg.symbol {
            return;
        }

        let gated = Self::apply_automation_gate(inner, trades);
        if gated.is_empty() {
            debug!(symbol = %inner.cfg.symbol, "nothing left to execute after gating");
            return;
        }

        match inner.cfg.mode {
            ExecutionMode::Immediate => Self::execute(inner, &gated),
            ExecutionMode::Batch => {
                let flush: Option<Vec<Trades>> = {
                    let mut pending = inner.pending.lock();
                    pending.push(gated);
                    if pending.len() >= inner.cfg.batch_size {
                        Some(pending.drain(..).collect())
                    } else {
                        None
                    }
                };
                if let Some(batches) = flush {
                    info!(
                        symbol = %inner.cfg.symbol,
                        batches = batches.len(),
                        "flushing batched trades"
                    );
                    for batch in batches {
                        Self::execute(inner, &batch);
                    }
                }
            }
        }
    }

    /// Signal events are consumed for observability counters only.
    fn on_signal(inner: &Arc<Inner>, event: &Event) {
        inner.core.bump("events_received");
        match &event.payload {
            EventPayload::EntrySignal { symbol, .. } if *symbol == inner.cfg.symbol => {
                inner.core.bump("entry_signals_seen");
            }
            EventPayload::ExitSignal { symbol, .. } if *symbol == inner.cfg.symbol => {
                inner.core.bump("exit_signals_seen");
            }
            _ => {}
        }
    }

    /// Strip entries when automation is off, rejecting each one visibly.
    fn apply_automation_gate(inner: &Arc<Inner>, trades: &Trades) -> Trades {
        let enabled = inner
            .automation
            .as_ref()
            .map(|a| a.is_enabled())
            .unwrap_or(true);
        if enabled {
            return trades.clone();
        }

        for entry in &trades.entries {
            warn!(
                symbol = %entry.symbol,
                strategy = %entry.strategy_name,
                direction = %entry.direction,
                "entry rejected: automation disabled"
            );
            inner.core.publish(EventPayload::OrderRejected {
                symbol: entry.symbol.clone(),
                direction: entry.direction,
                reason: "automation_disabled".to_string(),
                strategy_name: Some(entry.strategy_name.clone()),
            });
            inner.core.bump("trades_rejected_automation");
            inner.core.bump("orders_rejected");
        }
        trades.exits_only()
    }

    fn execute(inner: &Arc<Inner>, trades: &Trades) {
        info!(
            symbol = %inner.cfg.symbol,
            entries = trades.entries.len(),
            exits = trades.exits.len(),
            "executing trades"
        );

        let report = match inner.broker.execute_trading_cycle(trades) {
            Ok(report) => report,
            Err(e) => {
                inner.core.bump("execution_errors");
                inner.core.record_error("execute_trading_cycle", &e);
                return;
            }
        };

        inner.core.bump("trades_executed");
        Self::publish_outcome(inner, trades, &report);
    }

    fn publish_outcome(inner: &Arc<Inner>, trades: &Trades, report: &CycleReport) {
        let ctx = &report.context;

        if !ctx.trade_authorized {
            let mut reasons = Vec::new();
            if ctx.news_block_active {
                reasons.push("news_block".to_string());
            }
            if ctx.market_closing_soon {
                reasons.push("market_closing".to_string());
            }
            if ctx.risk_breached {
                reasons.push("risk_breach".to_string());
            }
            warn!(symbol = %inner.cfg.symbol, reasons = ?reasons, "trading blocked");
            inner.core.publish(EventPayload::TradingBlocked {
                symbol: inner.cfg.symbol.clone(),
                reasons,
            });

            if ctx.risk_breached {
                inner.core.publish(EventPayload::RiskLimitBreached {
                    limit_type: "broker_risk".to_string(),
                    current_value: ctx.total_pnl,
                    limit_value: 0.0,
                    symbol: Some(inner.cfg.symbol.clone()),
                });
                inner.core.bump("risk_breaches");
            }
            return;
        }

        inner.core.publish(EventPayload::TradingAuthorized {
            symbol: inner.cfg.symbol.clone(),
            reason: "all_checks_passed".to_string(),
        });

        for fill in &report.fills {
            inner.core.publish(EventPayload::OrderPlaced {
                ticket: fill.ticket,
                symbol: inner.cfg.symbol.clone(),
                direction: fill.direction,
                volume: fill.volume,
                entry_price: fill.price,
                stop_loss: fill.stop_loss,
                take_profit: fill.take_profit,
                strategy_name: Some(fill.strategy_name.clone()),
                magic: Some(fill.magic),
            });
            inner.core.bump("orders_placed");
        }

        for closed in &report.closed {
            inner.core.publish(EventPayload::PositionClosed {
                ticket: closed.ticket,
                symbol: inner.cfg.symbol.clone(),
                direction: closed.direction,
                volume: closed.volume,
                profit: closed.profit,
                close_price: closed.close_price,
                strategy_name: closed.strategy_name.clone(),
                reason: "exit_signal".to_string(),
            });
            inner.core.bump("positions_closed");
        }

        // One TradesExecuted per executed entry decision: its ladder plus the
        // tickets of the fills the broker attributed to that decision.
        for entry in &trades.entries {
            let decision_fills: Vec<_> = report
                .fills
                .iter()
                .filter(|f| f.magic == entry.magic && f.direction == entry.direction)
                .collect();
            if decision_fills.is_empty() {
                continue;
            }

            let tickets: Vec<u64> = decision_fills.iter().map(|f| f.ticket).collect();
            let total_volume: f64 = decision_fills.iter().map(|f| f.volume).sum();
            inner.core.publish(EventPayload::TradesExecuted {
                symbol: inner.cfg.symbol.clone(),
                direction: entry.direction,
                total_volume,
                order_count: tickets.len(),
                strategy_name: Some(entry.strategy_name.clone()),
                metadata: TradeMetadata {
                    tp_targets: entry.take_profit.ladder.clone(),
                    tickets,
                    group_id: report.group_id.clone(),
                },
            });
        }
    }

    fn flush_pending(inner: &Arc<Inner>) {
        let batches: Vec<Trades> = inner.pending.lock().drain(..).collect();
        if batches.is_empty() {
            return;
        }
        info!(
            symbol = %inner.cfg.symbol,
            batches = batches.len(),
            "flushing pending trades before stop"
        );
        for batch in batches {
            Self::execute(inner, &batch);
        }
    }
}

impl Service for ExecutionService {
    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn start(&self) -> anyhow::Result<()> {
        let trades_inner = Arc::clone(&self.inner);
        self.inner.core.subscribe(
            EventKind::TradesReady,
            Arc::new(move |event| {
                Inner::on_trades_ready(&trades_inner, event);
                Ok(())
            }),
        );

        for kind in [EventKind::EntrySignal, EventKind::ExitSignal] {
            let signal_inner = Arc::clone(&self.inner);
            self.inner.core.subscribe(
                kind,
                Arc::new(move |event| {
                    Inner::on_signal(&signal_inner, event);
                    Ok(())
                }),
            );
        }

        self.inner.core.set_state(ServiceState::Running);
        self.inner.core.log_started();
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Inner::flush_pending(&self.inner);
        self.inner.core.release_subscriptions();
        self.inner.core.set_state(ServiceState::Stopped);
        self.inner.core.log_stopped();
        Ok(())
    }

    fn health_check(&self) -> HealthReport {
        self.inner.core.health("execution_errors")
    }

    fn metrics(&self) -> std::collections::BTreeMap<String, u64> {
        self.inner.core.metrics_snapshot()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, TradingContext};
    use crate::decision::{
        Direction, EntryDecision, ExitDecision, StopLossSpec, TakeProfitSpec, TpTarget,
    };
    use crate::events::AutomationAction;
    use crate::testutil::ScriptedBroker;
    use chrono::Utc;

    fn entry(symbol: &str, magic: u64) -> EntryDecision {
        EntryDecision {
            symbol: symbol.to_string(),
            strategy_name: "momentum".to_string(),
            magic,
            direction: Direction::Long,
            entry_price: 100.0,
            position_size: 1.0,
            stop_loss: StopLossSpec {
                kind: "fixed".to_string(),
                level: 97.0,
            },
            take_profit: TakeProfitSpec {
                kind: "ladder".to_string(),
                level: 108.0,
                ladder: vec![
                    TpTarget {
                        level: 105.0,
                        percent: 50.0,
                        move_stop: true,
                    },
                    TpTarget {
                        level: 108.0,
                        percent: 50.0,
                        move_stop: false,
                    },
                ],
            },
            decision_time: Utc::now(),
        }
    }

    fn exit(symbol: &str, magic: u64) -> ExitDecision {
        ExitDecision {
            symbol: symbol.to_string(),
            strategy_name: "momentum".to_string(),
            magic,
            direction: Direction::Long,
            decision_time: Utc::now(),
        }
    }

    fn trades_ready(symbol: &str, trades: Trades) -> Event {
        Event::new(EventPayload::TradesReady {
            symbol: symbol.to_string(),
            num_entries: trades.entries.len(),
            num_exits: trades.exits.len(),
            trades: Arc::new(trades),
        })
    }

    fn count(bus: &EventBus, kind: EventKind) -> usize {
        bus.history(Some(kind), None).len()
    }

    fn service(
        bus: Arc<EventBus>,
        broker: Arc<dyn BrokerAdapter>,
        automation: Option<Arc<AutomationStateManager>>,
    ) -> ExecutionService {
        let svc =
            ExecutionService::new(bus, broker, automation, ExecutionConfig::new("EURUSD")).unwrap();
        svc.start().unwrap();
        svc
    }

    #[test]
    fn entry_batch_places_orders_and_feeds_monitor() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(PaperBroker::new());
        let svc = service(bus.clone(), broker.clone(), None);

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![entry("EURUSD", 7)],
                exits: vec![],
            },
        ));

        assert_eq!(count(&bus, EventKind::TradingAuthorized), 1);
        assert_eq!(count(&bus, EventKind::OrderPlaced), 1);
        let executed = bus.history(Some(EventKind::TradesExecuted), None);
        assert_eq!(executed.len(), 1);
        match &executed[0].payload {
            EventPayload::TradesExecuted {
                metadata,
                order_count,
                ..
            } => {
                assert_eq!(*order_count, 1);
                assert_eq!(metadata.tickets.len(), 1);
                assert_eq!(metadata.tp_targets.len(), 2);
                assert!(metadata.group_id.is_some());
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(svc.metrics()["orders_placed"], 1);
        assert_eq!(broker.position_count(), 1);
    }

    #[test]
    fn other_symbols_are_filtered() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ScriptedBroker::new());
        let _svc = service(bus.clone(), broker.clone(), None);

        bus.publish(trades_ready(
            "XAUUSD",
            Trades {
                entries: vec![entry("XAUUSD", 7)],
                exits: vec![],
            },
        ));
        assert!(broker.cycle_calls.lock().is_empty());
    }

    #[test]
    fn automation_disabled_rejects_entries_executes_exits() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let automation = Arc::new(AutomationStateManager::new(
            bus.clone(),
            dir.path().join("state.json"),
            true,
        ));
        let broker = Arc::new(ScriptedBroker::new());
        let svc = service(bus.clone(), broker.clone(), Some(automation));

        bus.publish(Event::new(EventPayload::ToggleAutomation {
            action: AutomationAction::Disable,
            reason: "test".to_string(),
            requested_by: "tests".to_string(),
        }));

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![entry("EURUSD", 7)],
                exits: vec![exit("EURUSD", 7)],
            },
        ));

        let rejected = bus.history(Some(EventKind::OrderRejected), None);
        assert_eq!(rejected.len(), 1);
        match &rejected[0].payload {
            EventPayload::OrderRejected { reason, .. } => {
                assert_eq!(reason, "automation_disabled")
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(svc.metrics()["trades_rejected_automation"], 1);

        // The exit still reached the broker, without the entry.
        let calls = broker.cycle_calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].entries.is_empty());
        assert_eq!(calls[0].exits.len(), 1);
    }

    #[test]
    fn automation_disabled_with_only_entries_skips_broker() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let automation = Arc::new(AutomationStateManager::new(
            bus.clone(),
            dir.path().join("state.json"),
            false,
        ));
        let broker = Arc::new(ScriptedBroker::new());
        let _svc = service(bus.clone(), broker.clone(), Some(automation));

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![entry("EURUSD", 7)],
                exits: vec![],
            },
        ));
        assert!(broker.cycle_calls.lock().is_empty());
        assert_eq!(count(&bus, EventKind::OrderRejected), 1);
    }

    #[test]
    fn blocked_context_publishes_reasons_and_risk_breach() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ScriptedBroker::new());
        broker.queue_cycle_report(CycleReport::blocked(TradingContext {
            trade_authorized: false,
            news_block_active: true,
            market_closing_soon: false,
            risk_breached: true,
            total_pnl: -123.0,
        }));
        let svc = service(bus.clone(), broker, None);

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![entry("EURUSD", 7)],
                exits: vec![],
            },
        ));

        let blocked = bus.history(Some(EventKind::TradingBlocked), None);
        assert_eq!(blocked.len(), 1);
        match &blocked[0].payload {
            EventPayload::TradingBlocked { reasons, .. } => {
                assert_eq!(reasons, &vec!["news_block".to_string(), "risk_breach".to_string()]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(count(&bus, EventKind::RiskLimitBreached), 1);
        assert_eq!(count(&bus, EventKind::OrderPlaced), 0);
        assert_eq!(svc.metrics()["risk_breaches"], 1);
    }

    #[test]
    fn exits_publish_position_closed() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(PaperBroker::new());
        // Open a position first so the exit has something to close.
        broker
            .execute_trading_cycle(&Trades {
                entries: vec![entry("EURUSD", 7)],
                exits: vec![],
            })
            .unwrap();
        broker.set_price("EURUSD", 104.0);
        let _svc = service(bus.clone(), broker, None);

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![],
                exits: vec![exit("EURUSD", 7)],
            },
        ));

        let closed = bus.history(Some(EventKind::PositionClosed), None);
        assert_eq!(closed.len(), 1);
        match &closed[0].payload {
            EventPayload::PositionClosed { profit, .. } => {
                assert!((profit - 4.0).abs() < 1e-9)
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn batch_mode_accumulates_until_flush() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ScriptedBroker::new());
        let cfg = ExecutionConfig {
            mode: ExecutionMode::Batch,
            batch_size: 2,
            ..ExecutionConfig::new("EURUSD")
        };
        let svc = ExecutionService::new(bus.clone(), broker.clone(), None, cfg).unwrap();
        svc.start().unwrap();

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![entry("EURUSD", 7)],
                exits: vec![],
            },
        ));
        assert!(broker.cycle_calls.lock().is_empty());
        assert_eq!(svc.pending_batches(), 1);

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![entry("EURUSD", 8)],
                exits: vec![],
            },
        ));
        assert_eq!(broker.cycle_calls.lock().len(), 2);
        assert_eq!(svc.pending_batches(), 0);
    }

    #[test]
    fn stop_flushes_pending_batches() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ScriptedBroker::new());
        let cfg = ExecutionConfig {
            mode: ExecutionMode::Batch,
            batch_size: 10,
            ..ExecutionConfig::new("EURUSD")
        };
        let svc = ExecutionService::new(bus.clone(), broker.clone(), None, cfg).unwrap();
        svc.start().unwrap();

        bus.publish(trades_ready(
            "EURUSD",
            Trades {
                entries: vec![entry("EURUSD", 7)],
                exits: vec![],
            },
        ));
        assert!(broker.cycle_calls.lock().is_empty());

        svc.stop().unwrap();
        assert_eq!(broker.cycle_calls.lock().len(), 1);
    }

    #[test]
    fn signal_events_only_update_counters() {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ScriptedBroker::new());
        let svc = service(bus.clone(), broker.clone(), None);

        bus.publish(Event::new(EventPayload::EntrySignal {
            strategy_name: "momentum".to_string(),
            symbol: "EURUSD".to_string(),
            direction: Direction::Long,
            entry_price: Some(100.0),
        }));
        assert_eq!(svc.metrics()["entry_signals_seen"], 1);
        assert!(broker.cycle_calls.lock().is_empty());
    }
}
