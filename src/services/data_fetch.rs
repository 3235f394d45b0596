// =============================================================================
// Data Fetch Service — poll the data source, detect new closed candles
// =============================================================================
//
// For one symbol and its configured timeframes: each `fetch()` pulls the most
// recent bars per timeframe, publishes `DataFetched`, and emits `NewCandle`
// when the nth-from-end bar's timestamp has advanced past the last known one.
// Timeframes are processed in configured order; one timeframe's failure never
// blocks the others.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::errors::ConfigError;
use crate::events::EventPayload;
use crate::market::{Candle, DataSource};
use crate::service::{HealthReport, Service, ServiceCore, ServiceState};

/// Configuration for the data fetch service.
#[derive(Debug, Clone)]
pub struct DataFetchConfig {
    pub symbol: String,
    pub timeframes: Vec<String>,
    /// 1 = the most recent (forming) bar, 2 = the last closed bar, ...
    pub candle_index: usize,
    /// Bars requested per fetch; must cover `candle_index`.
    pub nbr_bars: usize,
}

impl DataFetchConfig {
    pub fn new(symbol: impl Into<String>, timeframes: Vec<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframes,
            candle_index: 1,
            nbr_bars: 3,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.timeframes.is_empty() {
            return Err(ConfigError::NoTimeframes);
        }
        if self.candle_index < 1 {
            return Err(ConfigError::invalid("candle_index", "must be >= 1"));
        }
        if self.nbr_bars < self.candle_index {
            return Err(ConfigError::invalid(
                "nbr_bars",
                "must be >= candle_index",
            ));
        }
        Ok(())
    }
}

/// Per-symbol market data poller.
pub struct DataFetchService {
    core: ServiceCore,
    source: Arc<dyn DataSource>,
    cfg: DataFetchConfig,
    last_known: Mutex<HashMap<String, Candle>>,
}

impl DataFetchService {
    pub fn new(
        bus: Arc<EventBus>,
        source: Arc<dyn DataSource>,
        cfg: DataFetchConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        info!(
            symbol = %cfg.symbol,
            timeframes = ?cfg.timeframes,
            candle_index = cfg.candle_index,
            nbr_bars = cfg.nbr_bars,
            "data fetch service created"
        );
        Ok(Self {
            core: ServiceCore::new(format!("data-fetch-{}", cfg.symbol.to_lowercase()), bus),
            source,
            cfg,
            last_known: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch all timeframes once. Returns the number of successful fetches.
    pub fn fetch(&self) -> usize {
        if !self.core.is_running() {
            warn!(
                service = %self.core.name(),
                state = %self.core.state(),
                "fetch skipped: service not running"
            );
            return 0;
        }

        let mut success = 0usize;
        for timeframe in &self.cfg.timeframes {
            match self.fetch_timeframe(timeframe) {
                Ok(()) => success += 1,
                Err(e) => {
                    self.publish_fetch_error(timeframe, &e.to_string());
                    self.core.record_error(&format!("fetch {timeframe}"), &e);
                }
            }
        }
        success
    }

    fn fetch_timeframe(&self, timeframe: &str) -> anyhow::Result<()> {
        let bars = self
            .source
            .stream(&self.cfg.symbol, timeframe, self.cfg.nbr_bars)?;

        if bars.is_empty() {
            anyhow::bail!("empty frame received");
        }
        if bars.len() < self.cfg.candle_index {
            anyhow::bail!(
                "frame too short: {} bars, candle_index {}",
                bars.len(),
                self.cfg.candle_index
            );
        }

        self.core.bump("data_fetches");
        let candidate = bars[bars.len() - self.cfg.candle_index];
        let num_bars = bars.len();

        self.core.publish(EventPayload::DataFetched {
            symbol: self.cfg.symbol.clone(),
            timeframe: timeframe.to_string(),
            bars: Arc::new(bars),
            num_bars,
        });

        let mut last_known = self.last_known.lock();
        let is_new = match last_known.get(timeframe) {
            None => true,
            Some(last) => candidate.time > last.time,
        };

        if is_new {
            match last_known.get(timeframe) {
                Some(old) => info!(
                    symbol = %self.cfg.symbol,
                    timeframe,
                    old_time = %old.time,
                    new_time = %candidate.time,
                    close = candidate.close,
                    "new candle detected"
                ),
                None => info!(
                    symbol = %self.cfg.symbol,
                    timeframe,
                    time = %candidate.time,
                    close = candidate.close,
                    "first candle detected"
                ),
            }
            last_known.insert(timeframe.to_string(), candidate);
            drop(last_known);

            self.core.publish(EventPayload::NewCandle {
                symbol: self.cfg.symbol.clone(),
                timeframe: timeframe.to_string(),
                candle: candidate,
            });
            self.core.bump("new_candles_detected");
        } else {
            debug!(symbol = %self.cfg.symbol, timeframe, "no new candle");
        }

        Ok(())
    }

    fn publish_fetch_error(&self, timeframe: &str, error: &str) {
        self.core.publish(EventPayload::DataFetchError {
            symbol: self.cfg.symbol.clone(),
            timeframe: timeframe.to_string(),
            error: error.to_string(),
        });
        self.core.bump("fetch_errors");
    }

    /// Forget the last known bar(s) so the next fetch re-emits `NewCandle`.
    pub fn reset_last_known_bars(&self, timeframe: Option<&str>) {
        let mut last_known = self.last_known.lock();
        match timeframe {
            None => {
                last_known.clear();
                info!(service = %self.core.name(), "reset last known bars (all)");
            }
            Some(tf) if self.cfg.timeframes.iter().any(|t| t == tf) => {
                last_known.remove(tf);
                info!(service = %self.core.name(), timeframe = tf, "reset last known bar");
            }
            Some(tf) => {
                warn!(timeframe = tf, "cannot reset unknown timeframe");
            }
        }
    }

    pub fn last_known_bar(&self, timeframe: &str) -> Option<Candle> {
        self.last_known.lock().get(timeframe).copied()
    }
}

impl Service for DataFetchService {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn start(&self) -> anyhow::Result<()> {
        // Fresh detection state on every (re)start.
        self.last_known.lock().clear();
        self.core.set_state(ServiceState::Running);
        self.core.log_started();
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.core.release_subscriptions();
        self.last_known.lock().clear();
        self.core.set_state(ServiceState::Stopped);
        self.core.log_stopped();
        Ok(())
    }

    fn health_check(&self) -> HealthReport {
        self.core.health("fetch_errors")
    }

    fn metrics(&self) -> std::collections::BTreeMap<String, u64> {
        self.core.metrics_snapshot()
    }
}
