// =============================================================================
// Orchestrator — wiring, driver loop, supervision
// =============================================================================
//
// Owns the shared bus, the automation manager + toggle watcher, the account
// risk guard, and one service quintet per symbol (fetch, indicators,
// strategy, execution, monitor). The driver loop is single-threaded: per
// tick it runs the account-risk check, then every symbol's fetch and
// position check in configured order, then (when due) health checks with
// optional auto-restart. A risk breach stops execution + evaluation for all
// symbols and ends the loop.
//
// Shutdown stops services in reverse dependency order per symbol, then the
// watcher and the automation manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::automation::{AutomationStateManager, ToggleFileWatcher};
use crate::broker::BrokerAdapter;
use crate::bus::EventBus;
use crate::config::SystemConfig;
use crate::errors::ConfigError;
use crate::market::DataSource;
use crate::risk::AccountRiskGuard;
use crate::service::Service;
use crate::services::{
    DataFetchConfig, DataFetchService, ExecutionConfig, ExecutionMode, ExecutionService,
    IndicatorConfig, IndicatorService, PositionMonitorConfig, PositionMonitorService,
    StrategyEvalConfig, StrategyEvalService, TpTargetStore,
};
use crate::strategy::{EntryManager, StrategyEngine};

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorStatus {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Per-symbol collaborators supplied by the composition root.
pub struct SymbolComponents {
    pub strategy_engine: Arc<dyn StrategyEngine>,
    pub entry_manager: Arc<dyn EntryManager>,
    pub tp_store: Arc<dyn TpTargetStore>,
}

/// The five services driving one symbol.
pub struct SymbolServices {
    pub data_fetch: Arc<DataFetchService>,
    pub indicators: Arc<IndicatorService>,
    pub strategy: Arc<StrategyEvalService>,
    pub execution: Arc<ExecutionService>,
    pub monitor: Arc<PositionMonitorService>,
}

impl SymbolServices {
    /// Start order; stop order is the reverse.
    fn ordered(&self) -> Vec<Arc<dyn Service>> {
        vec![
            self.data_fetch.clone(),
            self.indicators.clone(),
            self.strategy.clone(),
            self.execution.clone(),
            self.monitor.clone(),
        ]
    }
}

/// Engine orchestrator: builds, drives, supervises, and tears down the
/// per-symbol pipelines.
pub struct Orchestrator {
    cfg: SystemConfig,
    bus: Arc<EventBus>,
    broker: Arc<dyn BrokerAdapter>,
    services: Vec<(String, SymbolServices)>,
    automation: Arc<AutomationStateManager>,
    watcher: Option<ToggleFileWatcher>,
    risk_guard: Option<Arc<AccountRiskGuard>>,

    status: RwLock<OrchestratorStatus>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    trading_halted: AtomicBool,
    last_health_check: Mutex<Option<Instant>>,
    last_account_check: Mutex<Option<Instant>>,
}

impl Orchestrator {
    /// Build the full engine. `components` must contain an entry for every
    /// configured symbol.
    pub fn new(
        cfg: SystemConfig,
        source: Arc<dyn DataSource>,
        broker: Arc<dyn BrokerAdapter>,
        mut components: HashMap<String, SymbolComponents>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;

        let bus = Arc::new(EventBus::new(
            cfg.event_bus.event_history_limit,
            cfg.event_bus.log_all_events,
        ));

        let automation = Arc::new(AutomationStateManager::new(
            bus.clone(),
            &cfg.automation.state_file,
            cfg.automation.enabled,
        ));

        let watcher = if cfg.automation.file_watcher_enabled {
            let toggle = std::path::PathBuf::from(&cfg.automation.toggle_file);
            let log = toggle.with_file_name("automation_actions.log");
            Some(ToggleFileWatcher::new(
                bus.clone(),
                toggle,
                log,
                Duration::from_secs(cfg.automation.file_watcher_interval_secs),
            ))
        } else {
            None
        };

        let risk_guard = if cfg.risk.account_stop_loss.enabled {
            Some(Arc::new(AccountRiskGuard::new(
                cfg.risk.account_stop_loss.config.clone(),
                broker.clone(),
                Some(bus.clone()),
            )))
        } else {
            None
        };

        let symbols = cfg.normalized_symbols();
        let timeframes = cfg.trading.timeframes.clone();
        let mut services = Vec::with_capacity(symbols.len());

        for symbol in &symbols {
            let parts = components.remove(symbol).ok_or_else(|| {
                ConfigError::invalid("trading.symbols", format!("no components for {symbol}"))
            })?;

            info!(symbol = %symbol, "building services");

            let fetch_section = &cfg.services.data_fetching;
            let data_fetch = Arc::new(DataFetchService::new(
                bus.clone(),
                source.clone(),
                DataFetchConfig {
                    symbol: symbol.clone(),
                    timeframes: timeframes.clone(),
                    candle_index: fetch_section.candle_index,
                    nbr_bars: fetch_section.nbr_bars,
                },
            )?);

            let ind_section = &cfg.services.indicator_calculation;
            let indicators = Arc::new(IndicatorService::new(
                bus.clone(),
                source.clone(),
                IndicatorConfig {
                    symbol: symbol.clone(),
                    timeframes: timeframes.clone(),
                    track_regime_changes: ind_section.track_regime_changes,
                    recent_rows_limit: ind_section.recent_rows_limit,
                    stack: ind_section.stack.clone(),
                    regime: ind_section.regime.clone(),
                },
            )?);

            let strategy = Arc::new(StrategyEvalService::new(
                bus.clone(),
                parts.strategy_engine,
                parts.entry_manager,
                Some(broker.clone()),
                Some(automation.clone()),
                StrategyEvalConfig {
                    symbol: symbol.clone(),
                    min_rows_required: cfg.services.strategy_evaluation.min_rows_required,
                },
            )?);

            let exec_section = &cfg.services.trade_execution;
            let mode = if exec_section.execution_mode == "batch" {
                ExecutionMode::Batch
            } else {
                ExecutionMode::Immediate
            };
            let execution = Arc::new(ExecutionService::new(
                bus.clone(),
                broker.clone(),
                Some(automation.clone()),
                ExecutionConfig {
                    symbol: symbol.clone(),
                    mode,
                    batch_size: exec_section.batch_size,
                },
            )?);

            let monitor_section = &cfg.services.position_monitor;
            let monitor = Arc::new(PositionMonitorService::new(
                bus.clone(),
                broker.clone(),
                parts.tp_store,
                PositionMonitorConfig {
                    symbol: symbol.clone(),
                    enable_tp_management: monitor_section.enable_tp_management,
                    enable_sl_management: monitor_section.enable_sl_management,
                },
            )?);

            services.push((
                symbol.clone(),
                SymbolServices {
                    data_fetch,
                    indicators,
                    strategy,
                    execution,
                    monitor,
                },
            ));
        }

        info!(
            symbols = ?symbols,
            services = services.len() * 5,
            "orchestrator built"
        );

        Ok(Self {
            cfg,
            bus,
            broker,
            services,
            automation,
            watcher,
            risk_guard,
            status: RwLock::new(OrchestratorStatus::Initializing),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            trading_halted: AtomicBool::new(false),
            last_health_check: Mutex::new(None),
            last_account_check: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn automation(&self) -> &Arc<AutomationStateManager> {
        &self.automation
    }

    pub fn status(&self) -> OrchestratorStatus {
        *self.status.read()
    }

    pub fn symbol_services(&self, symbol: &str) -> Option<&SymbolServices> {
        self.services
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, services)| services)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the watcher, seed the risk guard, then start every service in
    /// dependency order. Must run inside a tokio runtime when the file
    /// watcher is enabled.
    pub fn start(&self) -> anyhow::Result<()> {
        info!("starting all services");

        if let Some(watcher) = &self.watcher {
            watcher.start();
        }

        if let Some(guard) = &self.risk_guard {
            match self.broker.balance() {
                Ok(balance) => guard.initialize(balance),
                Err(e) => warn!(error = %e, "risk guard not seeded: balance unavailable"),
            }
        }

        for (symbol, services) in &self.services {
            info!(symbol = %symbol, "starting symbol services");
            for service in services.ordered() {
                service
                    .start()
                    .map_err(|e| anyhow::anyhow!("failed to start {}: {e}", service.name()))?;
            }
        }

        *self.status.write() = OrchestratorStatus::Running;
        info!("all services started");
        Ok(())
    }

    /// Stop everything: services in reverse dependency order per symbol,
    /// then the watcher and the automation manager.
    pub async fn stop(&self) {
        info!("stopping all services");
        *self.status.write() = OrchestratorStatus::Stopping;

        for (symbol, services) in self.services.iter().rev() {
            for service in services.ordered().into_iter().rev() {
                if let Err(e) = service.stop() {
                    error!(symbol = %symbol, service = service.name(), error = %e, "stop failed");
                }
            }
        }

        if let Some(watcher) = &self.watcher {
            watcher.stop().await;
        }
        self.automation.stop();

        *self.status.write() = OrchestratorStatus::Stopped;
        info!("orchestrator stopped");
    }

    /// Ask the driver loop to exit at the next iteration boundary.
    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    // ── Driver loop ─────────────────────────────────────────────────────

    /// Run the tick loop until a stop request or a risk halt.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.cfg.orchestrator.tick_interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "trading loop starting");

        while !self.shutdown.load(Ordering::SeqCst) {
            let t0 = Instant::now();

            if self.account_preempt_check() {
                error!("account risk guard halted trading, leaving driver loop");
                break;
            }

            self.drive_symbols();

            if self.health_check_due() {
                self.perform_health_check().await;
            }

            let remaining = interval.saturating_sub(t0.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.shutdown_notify.notified() => {}
            }
        }

        info!("trading loop ended");
    }

    /// Returns true when trading is halted and the loop must end.
    fn account_preempt_check(&self) -> bool {
        let Some(guard) = &self.risk_guard else {
            return false;
        };

        if self.account_check_due() {
            match self.broker.balance() {
                Ok(balance) => {
                    let (count, exposure) = match self.broker.open_positions() {
                        Ok(positions) => (
                            positions.len(),
                            positions.iter().map(|p| p.volume * p.price_open).sum(),
                        ),
                        Err(_) => (0, 0.0),
                    };
                    guard.update_account_metrics(balance, count, exposure);
                }
                Err(e) => warn!(error = %e, "account check skipped: balance unavailable"),
            }
        }

        if guard.is_trading_allowed() {
            return false;
        }

        if guard.config().stop_trading_on_breach && !self.trading_halted.swap(true, Ordering::SeqCst)
        {
            error!(
                reason = ?guard.stop_reason(),
                "risk breach: stopping execution and evaluation services"
            );
            self.stop_trading_services();
        }
        true
    }

    /// Stop execution + evaluation for every symbol; data and indicator
    /// services keep running.
    fn stop_trading_services(&self) {
        for (symbol, services) in &self.services {
            if let Err(e) = services.execution.stop() {
                error!(symbol = %symbol, error = %e, "failed to stop execution service");
            }
            if let Err(e) = services.strategy.stop() {
                error!(symbol = %symbol, error = %e, "failed to stop strategy service");
            }
        }
    }

    /// One pass over all symbols: fetch, then position checks. An error in
    /// one symbol never aborts the others.
    fn drive_symbols(&self) {
        for (symbol, services) in &self.services {
            let fetched = services.data_fetch.fetch();
            debug!(symbol = %symbol, fetched, "tick fetch complete");

            if services.monitor.health_check().state
                == crate::service::ServiceState::Running
            {
                services.monitor.check_positions();
            }
        }
    }

    fn account_check_due(&self) -> bool {
        let mut last = self.last_account_check.lock();
        let interval = Duration::from_secs(self.cfg.orchestrator.account_check_interval_secs);
        let due = last.map(|t| t.elapsed() >= interval).unwrap_or(true);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    fn health_check_due(&self) -> bool {
        let mut last = self.last_health_check.lock();
        let interval = Duration::from_secs(self.cfg.orchestrator.health_check_interval_secs);
        let due = last.map(|t| t.elapsed() >= interval).unwrap_or(true);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Health-check every service; optionally restart the unhealthy ones.
    async fn perform_health_check(&self) {
        let mut unhealthy: Vec<(String, Arc<dyn Service>)> = Vec::new();

        for (symbol, services) in &self.services {
            for service in services.ordered() {
                let health = service.health_check();
                if !health.healthy {
                    warn!(
                        symbol = %symbol,
                        service = service.name(),
                        state = %health.state,
                        last_error = ?health.last_error,
                        "unhealthy service"
                    );
                    unhealthy.push((symbol.clone(), service));
                }
            }
        }

        if unhealthy.is_empty() || !self.cfg.orchestrator.enable_auto_restart {
            return;
        }

        for (symbol, service) in unhealthy {
            info!(symbol = %symbol, service = service.name(), "restarting unhealthy service");
            if let Err(e) = service.stop() {
                error!(service = service.name(), error = %e, "restart: stop failed");
                continue;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            match service.start() {
                Ok(()) => info!(service = service.name(), "service restarted"),
                Err(e) => error!(service = service.name(), error = %e, "restart: start failed"),
            }
        }
    }

    /// Health map for observability: symbol -> service name -> healthy.
    pub fn service_health(&self) -> HashMap<String, HashMap<String, bool>> {
        self.services
            .iter()
            .map(|(symbol, services)| {
                let map = services
                    .ordered()
                    .into_iter()
                    .map(|s| (s.name().to_string(), s.health_check().healthy))
                    .collect();
                (symbol.clone(), map)
            })
            .collect()
    }
}
