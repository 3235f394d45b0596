// =============================================================================
// Strategy Evaluation Service — signals in, sized decisions out
// =============================================================================
//
// On every `IndicatorsCalculated` for its symbol (once enough rows exist):
// evaluate the strategy engine, fetch the account balance best-effort, let
// the entry manager size the decisions, then publish one `TradesReady` batch
// plus individual `EntrySignal`/`ExitSignal` events for observers.
//
// Automation gating happens here for entries: with automation disabled, entry
// signals and the entries inside the batch are suppressed (counted under
// `entry_signals_suppressed`); exits always pass through.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::automation::AutomationStateManager;
use crate::broker::BrokerAdapter;
use crate::bus::EventBus;
use crate::decision::Trades;
use crate::errors::ConfigError;
use crate::events::{Event, EventKind, EventPayload};
use crate::indicators::RecentRows;
use crate::service::{HealthReport, Service, ServiceCore, ServiceState};
use crate::strategy::{EntryManager, StrategyEngine};

/// Configuration for the strategy evaluation service.
#[derive(Debug, Clone)]
pub struct StrategyEvalConfig {
    pub symbol: String,
    /// Minimum rows on at least one timeframe before evaluating.
    pub min_rows_required: usize,
}

impl StrategyEvalConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            min_rows_required: 3,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.min_rows_required < 1 {
            return Err(ConfigError::invalid("min_rows_required", "must be >= 1"));
        }
        Ok(())
    }
}

struct Inner {
    core: ServiceCore,
    cfg: StrategyEvalConfig,
    engine: Arc<dyn StrategyEngine>,
    entry_manager: Arc<dyn EntryManager>,
    broker: Option<Arc<dyn BrokerAdapter>>,
    automation: Option<Arc<AutomationStateManager>>,
    last_trades: Mutex<Option<Arc<Trades>>>,
}

/// Per-symbol strategy evaluator.
pub struct StrategyEvalService {
    inner: Arc<Inner>,
}

impl StrategyEvalService {
    pub fn new(
        bus: Arc<EventBus>,
        engine: Arc<dyn StrategyEngine>,
        entry_manager: Arc<dyn EntryManager>,
        broker: Option<Arc<dyn BrokerAdapter>>,
        automation: Option<Arc<AutomationStateManager>>,
        cfg: StrategyEvalConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        info!(
            symbol = %cfg.symbol,
            min_rows = cfg.min_rows_required,
            strategies = ?engine.strategy_names(),
            "strategy evaluation service created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                core: ServiceCore::new(format!("strategy-eval-{}", cfg.symbol.to_lowercase()), bus),
                cfg,
                engine,
                entry_manager,
                broker,
                automation,
                last_trades: Mutex::new(None),
            }),
        })
    }

    /// The last batch this service published (observability).
    pub fn last_trades(&self) -> Option<Arc<Trades>> {
        self.inner.last_trades.lock().clone()
    }
}

impl Inner {
    fn on_indicators(inner: &Arc<Inner>, event: &Event) {
        inner.core.bump("events_received");

        let EventPayload::IndicatorsCalculated {
            symbol,
            recent_rows,
            ..
        } = &event.payload
        else {
            return;
        };

        if *symbol != inner.cfg.symbol {
            return;
        }

        if !Self::has_sufficient_data(inner, recent_rows) {
            debug!(
                symbol = %inner.cfg.symbol,
                needed = inner.cfg.min_rows_required,
                "insufficient rows for evaluation"
            );
            return;
        }

        if let Err(e) = Self::evaluate(inner, recent_rows) {
            inner.core.publish(EventPayload::StrategyEvaluationError {
                symbol: inner.cfg.symbol.clone(),
                error: e.to_string(),
            });
            inner.core.bump("evaluation_errors");
            inner.core.record_error("evaluate", &e);
        }
    }

    fn has_sufficient_data(inner: &Arc<Inner>, rows: &RecentRows) -> bool {
        rows.values()
            .any(|r| r.len() >= inner.cfg.min_rows_required)
    }

    fn evaluate(inner: &Arc<Inner>, rows: &RecentRows) -> anyhow::Result<()> {
        let results = inner.engine.evaluate(rows)?;
        inner.core.bump("strategies_evaluated");

        // Balance lookup is best-effort: its absence must not block trading.
        let account_balance = match &inner.broker {
            Some(broker) => match broker.balance() {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!(error = %e, "balance fetch failed, sizing without it");
                    None
                }
            },
            None => None,
        };

        let trades = inner
            .entry_manager
            .manage_trades(&results, rows, account_balance)?;

        debug!(
            symbol = %inner.cfg.symbol,
            entries = trades.entries.len(),
            exits = trades.exits.len(),
            "trade decisions generated"
        );

        // ── Automation gating for entries ───────────────────────────────
        let automation_enabled = inner
            .automation
            .as_ref()
            .map(|a| a.is_enabled())
            .unwrap_or(true);

        let gated = if automation_enabled {
            trades
        } else {
            let suppressed = trades.entries.len();
            if suppressed > 0 {
                for _ in 0..suppressed {
                    inner.core.bump("entry_signals_suppressed");
                }
                info!(
                    symbol = %inner.cfg.symbol,
                    suppressed,
                    "automation disabled: entries suppressed"
                );
            }
            trades.exits_only()
        };

        if !gated.is_empty() {
            let batch = Arc::new(gated);
            *inner.last_trades.lock() = Some(Arc::clone(&batch));
            inner.core.publish(EventPayload::TradesReady {
                symbol: inner.cfg.symbol.clone(),
                num_entries: batch.entries.len(),
                num_exits: batch.exits.len(),
                trades: Arc::clone(&batch),
            });

            for entry in &batch.entries {
                inner.core.publish(EventPayload::EntrySignal {
                    strategy_name: entry.strategy_name.clone(),
                    symbol: entry.symbol.clone(),
                    direction: entry.direction,
                    entry_price: Some(entry.entry_price),
                });
                inner.core.bump("entry_signals_generated");
            }
            for exit in &batch.exits {
                inner.core.publish(EventPayload::ExitSignal {
                    strategy_name: exit.strategy_name.clone(),
                    symbol: exit.symbol.clone(),
                    direction: exit.direction,
                    reason: "signal".to_string(),
                });
                inner.core.bump("exit_signals_generated");
            }
        }

        Ok(())
    }
}

impl Service for StrategyEvalService {
    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn start(&self) -> anyhow::Result<()> {
        let handler_inner = Arc::clone(&self.inner);
        self.inner.core.subscribe(
            EventKind::IndicatorsCalculated,
            Arc::new(move |event| {
                Inner::on_indicators(&handler_inner, event);
                Ok(())
            }),
        );
        self.inner.core.set_state(ServiceState::Running);
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
        self.inner.core.health("evaluation_errors")
    }

    fn metrics(&self) -> std::collections::BTreeMap<String, u64> {
        self.inner.core.metrics_snapshot()
    }
}
