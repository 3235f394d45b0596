// =============================================================================
// Indicator Service — incremental indicators + regime per (symbol, timeframe)
// =============================================================================
//
// Subscribes to `NewCandle`. Each candle advances that timeframe's indicator
// stack and PIT regime detector, producing one enriched row appended to the
// bounded recent-rows ring. The service publishes `IndicatorsCalculated` with
// a snapshot of all timeframes' recent rows, and `RegimeChanged` when the
// emitted regime differs from the previously seen one.
//
// At start the service replays the data source's historical bars through the
// same state machines (no events), so classification is already warm when
// live candles arrive.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::errors::ConfigError;
use crate::events::{Event, EventKind, EventPayload};
use crate::indicators::{IndicatorStack, RecentRows, RowBuffer, StackConfig, DEFAULT_RECENT_ROWS};
use crate::market::{Candle, DataSource};
use crate::regime::{PitRegimeDetector, Regime, RegimeConfig};
use crate::service::{HealthReport, Service, ServiceCore, ServiceState};

/// Configuration for the indicator service.
#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub symbol: String,
    pub timeframes: Vec<String>,
    pub track_regime_changes: bool,
    pub recent_rows_limit: usize,
    pub stack: StackConfig,
    pub regime: RegimeConfig,
}

impl IndicatorConfig {
    pub fn new(symbol: impl Into<String>, timeframes: Vec<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframes,
            track_regime_changes: true,
            recent_rows_limit: DEFAULT_RECENT_ROWS,
            stack: StackConfig::default(),
            regime: RegimeConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.timeframes.is_empty() {
            return Err(ConfigError::NoTimeframes);
        }
        if self.recent_rows_limit < 1 {
            return Err(ConfigError::invalid("recent_rows_limit", "must be >= 1"));
        }
        Ok(())
    }
}

struct TimeframeState {
    stack: IndicatorStack,
    detector: PitRegimeDetector,
    rows: RowBuffer,
}

struct Inner {
    core: ServiceCore,
    cfg: IndicatorConfig,
    source: Arc<dyn DataSource>,
    states: Mutex<HashMap<String, TimeframeState>>,
    last_regimes: Mutex<HashMap<String, Regime>>,
}

/// Per-symbol indicator & regime engine.
pub struct IndicatorService {
    inner: Arc<Inner>,
}

impl IndicatorService {
    pub fn new(
        bus: Arc<EventBus>,
        source: Arc<dyn DataSource>,
        cfg: IndicatorConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        info!(
            symbol = %cfg.symbol,
            timeframes = ?cfg.timeframes,
            recent_rows = cfg.recent_rows_limit,
            "indicator service created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                core: ServiceCore::new(format!("indicators-{}", cfg.symbol.to_lowercase()), bus),
                cfg,
                source,
                states: Mutex::new(HashMap::new()),
                last_regimes: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Snapshot of recent rows across all timeframes.
    pub fn recent_rows(&self) -> RecentRows {
        Inner::recent_rows_snapshot(&self.inner.states.lock())
    }

    /// Last emitted regime for one timeframe.
    pub fn current_regime(&self, timeframe: &str) -> Option<Regime> {
        self.inner.last_regimes.lock().get(timeframe).copied()
    }
}

impl Inner {
    fn seed_from_historical(&self) {
        let mut states = self.states.lock();
        states.clear();
        self.last_regimes.lock().clear();

        for timeframe in &self.cfg.timeframes {
            let mut state = TimeframeState {
                stack: IndicatorStack::new(&self.cfg.stack),
                detector: PitRegimeDetector::new(self.cfg.regime.clone()),
                rows: RowBuffer::new(self.cfg.recent_rows_limit),
            };

            match self.source.historical(&self.cfg.symbol, timeframe) {
                Ok(bars) if !bars.is_empty() => {
                    for bar in &bars {
                        let snapshot = state.detector.process_bar(bar);
                        let indicators = state.stack.update(bar);
                        state.rows.push(
                            *bar,
                            indicators,
                            snapshot.regime,
                            snapshot.confidence,
                            snapshot.is_transition,
                        );
                        self.last_regimes
                            .lock()
                            .insert(timeframe.clone(), snapshot.regime);
                    }
                    info!(
                        symbol = %self.cfg.symbol,
                        timeframe,
                        bars = bars.len(),
                        "historical seed complete"
                    );
                }
                Ok(_) => {
                    debug!(symbol = %self.cfg.symbol, timeframe, "no historical bars to seed");
                }
                Err(e) => {
                    warn!(
                        symbol = %self.cfg.symbol,
                        timeframe,
                        error = %e,
                        "historical seed failed, starting cold"
                    );
                }
            }

            states.insert(timeframe.clone(), state);
        }
    }

    fn on_new_candle(inner: &Arc<Inner>, event: &Event) {
        inner.core.bump("events_received");

        let EventPayload::NewCandle {
            symbol,
            timeframe,
            candle,
        } = &event.payload
        else {
            return;
        };

        if *symbol != inner.cfg.symbol {
            return;
        }
        if !inner.cfg.timeframes.iter().any(|t| t == timeframe) {
            debug!(timeframe, "ignoring candle for unconfigured timeframe");
            return;
        }

        if let Err(e) = Self::process_candle(inner, timeframe, candle) {
            inner.core.publish(EventPayload::IndicatorError {
                symbol: inner.cfg.symbol.clone(),
                timeframe: timeframe.clone(),
                error: e.to_string(),
            });
            inner.core.bump("calculation_errors");
            inner
                .core
                .record_error(&format!("process candle {timeframe}"), &e);
        }
    }

    fn process_candle(inner: &Arc<Inner>, timeframe: &str, candle: &Candle) -> anyhow::Result<()> {
        let (row, recent, snapshot) = {
            let mut states = inner.states.lock();
            let state = states
                .get_mut(timeframe)
                .ok_or_else(|| anyhow::anyhow!("no state for timeframe {timeframe}"))?;

            let snapshot = state.detector.process_bar(candle);
            let indicators = state.stack.update(candle);
            let row = state.rows.push(
                *candle,
                indicators,
                snapshot.regime,
                snapshot.confidence,
                snapshot.is_transition,
            );
            (row, Self::recent_rows_snapshot(&states), snapshot)
        };

        inner.core.bump("indicators_calculated");
        debug!(
            symbol = %inner.cfg.symbol,
            timeframe,
            regime = %snapshot.regime,
            confidence = snapshot.confidence,
            is_transition = snapshot.is_transition,
            "indicators calculated"
        );

        inner.core.publish(EventPayload::IndicatorsCalculated {
            symbol: inner.cfg.symbol.clone(),
            timeframe: timeframe.to_string(),
            row,
            recent_rows: recent,
        });

        // Regime change detection against the last emitted regime.
        let previous = {
            let mut last = inner.last_regimes.lock();
            let previous = last.get(timeframe).copied();
            last.insert(timeframe.to_string(), snapshot.regime);
            previous
        };

        if inner.cfg.track_regime_changes {
            if let Some(old_regime) = previous {
                if old_regime != snapshot.regime {
                    info!(
                        symbol = %inner.cfg.symbol,
                        timeframe,
                        old = %old_regime,
                        new = %snapshot.regime,
                        confidence = snapshot.confidence,
                        "regime changed"
                    );
                    inner.core.publish(EventPayload::RegimeChanged {
                        symbol: inner.cfg.symbol.clone(),
                        timeframe: timeframe.to_string(),
                        old_regime,
                        new_regime: snapshot.regime,
                        confidence: snapshot.confidence,
                        is_transition: snapshot.is_transition,
                    });
                    inner.core.bump("regime_changes_detected");
                }
            }
        }

        Ok(())
    }

    fn recent_rows_snapshot(states: &HashMap<String, TimeframeState>) -> RecentRows {
        Arc::new(
            states
                .iter()
                .map(|(tf, state)| (tf.clone(), state.rows.rows()))
                .collect(),
        )
    }
}

impl Service for IndicatorService {
    fn name(&self) -> &str {
        self.inner.core.name()
    }

    fn start(&self) -> anyhow::Result<()> {
        self.inner.seed_from_historical();

        let handler_inner = Arc::clone(&self.inner);
        self.inner.core.subscribe(
            EventKind::NewCandle,
            Arc::new(move |event| {
                Inner::on_new_candle(&handler_inner, event);
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
        self.inner.core.health("calculation_errors")
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
    use crate::testutil::{candle, collect_events, trending_series, ScriptedDataSource};

    fn test_config(symbol: &str, timeframes: &[&str], warmup: usize) -> IndicatorConfig {
        IndicatorConfig {
            regime: RegimeConfig {
                warmup,
                persist_n: 1,
                ..RegimeConfig::default()
            },
            ..IndicatorConfig::new(symbol, timeframes.iter().map(|s| s.to_string()).collect())
        }
    }

    fn new_candle(symbol: &str, timeframe: &str, c: Candle) -> Event {
        Event::new(EventPayload::NewCandle {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            candle: c,
        })
    }

    use crate::market::Candle;

    #[test]
    fn historical_seed_fills_recent_rows_without_events() {
        let source = Arc::new(ScriptedDataSource::new());
        source.set_historical("EURUSD", "1", trending_series(40));
        let bus = Arc::new(EventBus::default());
        let published = collect_events(&bus, EventKind::IndicatorsCalculated);

        let svc = IndicatorService::new(bus, source, test_config("EURUSD", &["1"], 5)).unwrap();
        svc.start().unwrap();

        assert!(published.lock().is_empty());
        let rows = svc.recent_rows();
        assert_eq!(rows["1"].len(), DEFAULT_RECENT_ROWS);
        assert!(svc.current_regime("1").is_some());
    }

    #[test]
    fn new_candle_publishes_enriched_row() {
        let source = Arc::new(ScriptedDataSource::new());
        let bus = Arc::new(EventBus::default());
        let published = collect_events(&bus, EventKind::IndicatorsCalculated);

        let svc =
            IndicatorService::new(bus.clone(), source, test_config("EURUSD", &["1"], 500)).unwrap();
        svc.start().unwrap();

        bus.publish(new_candle("EURUSD", "1", candle(0, 100.0)));

        let events = published.lock();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::IndicatorsCalculated {
                row, recent_rows, ..
            } => {
                assert_eq!(row.regime, Regime::WarmingUp);
                assert_eq!(row.regime_confidence, 0.0);
                assert!(row.indicator("rsi").is_some());
                assert!(row.indicator("ema_20").is_some());
                assert!(row.indicator("macd_hist").is_none());
                assert_eq!(recent_rows["1"].len(), 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(svc.metrics()["indicators_calculated"], 1);
    }

    #[test]
    fn previous_fields_appear_from_second_candle() {
        let source = Arc::new(ScriptedDataSource::new());
        let bus = Arc::new(EventBus::default());
        let published = collect_events(&bus, EventKind::IndicatorsCalculated);

        let svc =
            IndicatorService::new(bus.clone(), source, test_config("EURUSD", &["1"], 500)).unwrap();
        svc.start().unwrap();

        bus.publish(new_candle("EURUSD", "1", candle(0, 100.0)));
        bus.publish(new_candle("EURUSD", "1", candle(1, 101.0)));

        let events = published.lock();
        match &events[1].payload {
            EventPayload::IndicatorsCalculated { row, .. } => {
                assert_eq!(row.previous_value("close"), Some(100.0));
                assert!(row.previous_value("rsi").is_some());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn other_symbols_and_timeframes_are_ignored() {
        let source = Arc::new(ScriptedDataSource::new());
        let bus = Arc::new(EventBus::default());
        let published = collect_events(&bus, EventKind::IndicatorsCalculated);

        let svc =
            IndicatorService::new(bus.clone(), source, test_config("EURUSD", &["1"], 500)).unwrap();
        svc.start().unwrap();

        bus.publish(new_candle("XAUUSD", "1", candle(0, 100.0)));
        bus.publish(new_candle("EURUSD", "15", candle(0, 100.0)));
        assert!(published.lock().is_empty());
    }

    #[test]
    fn regime_change_is_published_once_committed() {
        let source = Arc::new(ScriptedDataSource::new());
        let bus = Arc::new(EventBus::default());
        let changes = collect_events(&bus, EventKind::RegimeChanged);

        let svc =
            IndicatorService::new(bus.clone(), source, test_config("EURUSD", &["1"], 2)).unwrap();
        svc.start().unwrap();

        // Two warmup bars, then live classification takes over.
        for i in 0..5 {
            bus.publish(new_candle("EURUSD", "1", candle(i, 100.0 + i as f64)));
        }

        let events = changes.lock();
        assert!(!events.is_empty());
        match &events[0].payload {
            EventPayload::RegimeChanged { old_regime, new_regime, .. } => {
                assert_eq!(*old_regime, Regime::WarmingUp);
                assert_ne!(*new_regime, Regime::WarmingUp);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(svc.metrics()["regime_changes_detected"] >= 1);
    }

    #[test]
    fn regime_change_tracking_can_be_disabled() {
        let source = Arc::new(ScriptedDataSource::new());
        let bus = Arc::new(EventBus::default());
        let changes = collect_events(&bus, EventKind::RegimeChanged);

        let mut cfg = test_config("EURUSD", &["1"], 2);
        cfg.track_regime_changes = false;
        let svc = IndicatorService::new(bus.clone(), source, cfg).unwrap();
        svc.start().unwrap();

        for i in 0..5 {
            bus.publish(new_candle("EURUSD", "1", candle(i, 100.0 + i as f64)));
        }
        assert!(changes.lock().is_empty());
    }

    #[test]
    fn ring_capacity_bounds_recent_rows() {
        let source = Arc::new(ScriptedDataSource::new());
        let bus = Arc::new(EventBus::default());

        let mut cfg = test_config("EURUSD", &["1"], 500);
        cfg.recent_rows_limit = 3;
        let svc = IndicatorService::new(bus.clone(), source, cfg).unwrap();
        svc.start().unwrap();

        for i in 0..10 {
            bus.publish(new_candle("EURUSD", "1", candle(i, 100.0 + i as f64)));
        }
        let rows = svc.recent_rows();
        assert_eq!(rows["1"].len(), 3);
        assert_eq!(rows["1"][2].candle.close, 109.0);
    }

    #[test]
    fn stop_releases_subscription() {
        let source = Arc::new(ScriptedDataSource::new());
        let bus = Arc::new(EventBus::default());
        let published = collect_events(&bus, EventKind::IndicatorsCalculated);

        let svc =
            IndicatorService::new(bus.clone(), source, test_config("EURUSD", &["1"], 500)).unwrap();
        svc.start().unwrap();
        svc.stop().unwrap();

        bus.publish(new_candle("EURUSD", "1", candle(0, 100.0)));
        assert!(published.lock().is_empty());
        assert_eq!(svc.health_check().state, ServiceState::Stopped);
    }
}
