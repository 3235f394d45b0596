// =============================================================================
// System Configuration — validated engine settings with atomic save
// =============================================================================
//
// Every tunable of the engine lives here, grouped by concern. All fields
// carry serde defaults so an older JSON file keeps loading after new fields
// are added. Environment variables (`MERIDIAN_*`) override key fields:
// booleans accept true|1|yes|on case-insensitively, symbol/timeframe lists
// are comma-separated, and numeric values fall back to the file value when
// they fail to parse.
//
// Persistence uses the atomic tmp + rename pattern to prevent corruption on
// crash.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::ConfigError;
use crate::indicators::StackConfig;
use crate::regime::RegimeConfig;
use crate::risk::AccountStopConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["EURUSD".to_string()]
}

fn default_timeframes() -> Vec<String> {
    vec!["1".to_string(), "5".to_string(), "15".to_string()]
}

fn default_fetch_interval() -> u64 {
    5
}

fn default_candle_index() -> usize {
    1
}

fn default_nbr_bars() -> usize {
    3
}

fn default_recent_rows_limit() -> usize {
    6
}

fn default_min_rows_required() -> usize {
    3
}

fn default_execution_mode() -> String {
    "immediate".to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_event_history_limit() -> usize {
    1000
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_tick_interval() -> u64 {
    5
}

fn default_account_check_interval() -> u64 {
    10
}

fn default_daily_loss_limit() -> f64 {
    1_000.0
}

fn default_max_positions() -> usize {
    10
}

fn default_max_position_size() -> f64 {
    1.0
}

fn default_state_file() -> String {
    "config/automation_state.json".to_string()
}

fn default_toggle_file() -> String {
    "config/toggle_automation.txt".to_string()
}

fn default_watcher_interval() -> u64 {
    5
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSection {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
}

impl Default for TradingSection {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframes: default_timeframes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFetchSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_secs: u64,
    #[serde(default = "default_candle_index")]
    pub candle_index: usize,
    #[serde(default = "default_nbr_bars")]
    pub nbr_bars: usize,
}

impl Default for DataFetchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_interval_secs: default_fetch_interval(),
            candle_index: default_candle_index(),
            nbr_bars: default_nbr_bars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recent_rows_limit")]
    pub recent_rows_limit: usize,
    #[serde(default = "default_true")]
    pub track_regime_changes: bool,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
}

impl Default for IndicatorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            recent_rows_limit: default_recent_rows_limit(),
            track_regime_changes: true,
            stack: StackConfig::default(),
            regime: RegimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_rows_required")]
    pub min_rows_required: usize,
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_rows_required: default_min_rows_required(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "immediate" or "batch".
    #[serde(default = "default_execution_mode")]
    pub execution_mode: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            execution_mode: default_execution_mode(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMonitorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub enable_tp_management: bool,
    #[serde(default = "default_true")]
    pub enable_sl_management: bool,
}

impl Default for PositionMonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_tp_management: true,
            enable_sl_management: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesSection {
    #[serde(default)]
    pub data_fetching: DataFetchSection,
    #[serde(default)]
    pub indicator_calculation: IndicatorSection,
    #[serde(default)]
    pub strategy_evaluation: StrategySection,
    #[serde(default)]
    pub trade_execution: ExecutionSection,
    #[serde(default)]
    pub position_monitor: PositionMonitorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusSection {
    #[serde(default = "default_event_history_limit")]
    pub event_history_limit: usize,
    #[serde(default)]
    pub log_all_events: bool,
}

impl Default for EventBusSection {
    fn default() -> Self {
        Self {
            event_history_limit: default_event_history_limit(),
            log_all_events: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_true")]
    pub enable_auto_restart: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_account_check_interval")]
    pub account_check_interval_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            enable_auto_restart: true,
            health_check_interval_secs: default_health_check_interval(),
            tick_interval_secs: default_tick_interval(),
            account_check_interval_secs: default_account_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStopSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: AccountStopConfig,
}

impl Default for AccountStopSection {
    fn default() -> Self {
        Self {
            enabled: true,
            config: AccountStopConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSection {
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default)]
    pub account_stop_loss: AccountStopSection,
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            daily_loss_limit: default_daily_loss_limit(),
            max_positions: default_max_positions(),
            max_position_size: default_max_position_size(),
            account_stop_loss: AccountStopSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_toggle_file")]
    pub toggle_file: String,
    #[serde(default = "default_true")]
    pub file_watcher_enabled: bool,
    #[serde(default = "default_watcher_interval")]
    pub file_watcher_interval_secs: u64,
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            state_file: default_state_file(),
            toggle_file: default_toggle_file(),
            file_watcher_enabled: true,
            file_watcher_interval_secs: default_watcher_interval(),
        }
    }
}

// =============================================================================
// SystemConfig
// =============================================================================

/// Complete validated engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub trading: TradingSection,
    #[serde(default)]
    pub services: ServicesSection,
    #[serde(default)]
    pub event_bus: EventBusSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub automation: AutomationSection,
}

impl SystemConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        info!(
            path = %path.display(),
            symbols = ?config.trading.symbols,
            timeframes = ?config.trading.timeframes,
            "system config loaded"
        );
        Ok(config)
    }

    /// Persist using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("serialise system config to JSON")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create config dir {}", parent.display()))?;
            }
        }

        let tmp_path = std::path::PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("write tmp config {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("rename tmp config over {}", path.display()))?;

        info!(path = %path.display(), "system config saved (atomic)");
        Ok(())
    }

    /// Apply `MERIDIAN_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Override fields from a generic lookup (env in production, maps in
    /// tests).
    pub fn apply_overrides_from<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("MERIDIAN_SYMBOLS") {
            let symbols = parse_list(&v);
            if !symbols.is_empty() {
                info!(symbols = ?symbols, "symbols overridden from environment");
                self.trading.symbols = symbols;
            }
        }
        if let Some(v) = get("MERIDIAN_TIMEFRAMES") {
            let timeframes: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !timeframes.is_empty() {
                info!(timeframes = ?timeframes, "timeframes overridden from environment");
                self.trading.timeframes = timeframes;
            }
        }

        override_bool(&get, "MERIDIAN_AUTOMATION_ENABLED", &mut self.automation.enabled);
        override_bool(
            &get,
            "MERIDIAN_FILE_WATCHER_ENABLED",
            &mut self.automation.file_watcher_enabled,
        );
        override_bool(
            &get,
            "MERIDIAN_AUTO_RESTART",
            &mut self.orchestrator.enable_auto_restart,
        );
        override_bool(
            &get,
            "MERIDIAN_LOG_ALL_EVENTS",
            &mut self.event_bus.log_all_events,
        );

        override_num(
            &get,
            "MERIDIAN_DAILY_LOSS_LIMIT",
            &mut self.risk.account_stop_loss.config.daily_loss_limit,
        );
        override_num(
            &get,
            "MERIDIAN_TICK_INTERVAL",
            &mut self.orchestrator.tick_interval_secs,
        );
        override_num(
            &get,
            "MERIDIAN_HEALTH_CHECK_INTERVAL",
            &mut self.orchestrator.health_check_interval_secs,
        );
        override_num(
            &get,
            "MERIDIAN_FILE_WATCHER_INTERVAL",
            &mut self.automation.file_watcher_interval_secs,
        );
    }

    /// Validate the whole document. Any failure is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trading.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.trading.timeframes.is_empty() {
            return Err(ConfigError::NoTimeframes);
        }

        let fetch = &self.services.data_fetching;
        if !(1..=60).contains(&fetch.fetch_interval_secs) {
            return Err(ConfigError::invalid(
                "services.data_fetching.fetch_interval_secs",
                "must be within [1, 60]",
            ));
        }
        if fetch.candle_index < 1 {
            return Err(ConfigError::invalid(
                "services.data_fetching.candle_index",
                "must be >= 1",
            ));
        }
        if fetch.nbr_bars < fetch.candle_index {
            return Err(ConfigError::invalid(
                "services.data_fetching.nbr_bars",
                "must be >= candle_index",
            ));
        }
        if self.services.indicator_calculation.recent_rows_limit < 1 {
            return Err(ConfigError::invalid(
                "services.indicator_calculation.recent_rows_limit",
                "must be >= 1",
            ));
        }
        if self.services.strategy_evaluation.min_rows_required < 1 {
            return Err(ConfigError::invalid(
                "services.strategy_evaluation.min_rows_required",
                "must be >= 1",
            ));
        }
        let exec_mode = self.services.trade_execution.execution_mode.as_str();
        if exec_mode != "immediate" && exec_mode != "batch" {
            return Err(ConfigError::invalid(
                "services.trade_execution.execution_mode",
                "must be \"immediate\" or \"batch\"",
            ));
        }
        if self.services.trade_execution.batch_size < 1 {
            return Err(ConfigError::invalid(
                "services.trade_execution.batch_size",
                "must be >= 1",
            ));
        }

        if self.orchestrator.health_check_interval_secs < 10 {
            return Err(ConfigError::invalid(
                "orchestrator.health_check_interval_secs",
                "must be >= 10",
            ));
        }

        if self.risk.daily_loss_limit < 0.0 {
            return Err(ConfigError::invalid(
                "risk.daily_loss_limit",
                "must be >= 0",
            ));
        }
        if self.risk.max_positions < 1 {
            return Err(ConfigError::invalid("risk.max_positions", "must be >= 1"));
        }
        if self.risk.max_position_size < 0.01 {
            return Err(ConfigError::invalid(
                "risk.max_position_size",
                "must be >= 0.01",
            ));
        }

        if !(1..=60).contains(&self.automation.file_watcher_interval_secs) {
            return Err(ConfigError::invalid(
                "automation.file_watcher_interval_secs",
                "must be within [1, 60]",
            ));
        }

        Ok(())
    }

    /// Symbols normalised to uppercase.
    pub fn normalized_symbols(&self) -> Vec<String> {
        self.trading
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

// =============================================================================
// Override helpers
// =============================================================================

/// Case-insensitive boolean: true|1|yes|on and false|0|no|off.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn override_bool<F>(get: &F, key: &str, target: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        match parse_bool(&raw) {
            Some(v) => {
                info!(key, value = v, "boolean overridden from environment");
                *target = v;
            }
            None => warn!(key, raw = %raw, "unparseable boolean override ignored"),
        }
    }
}

fn override_num<F, T>(get: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    if let Some(raw) = get(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => {
                info!(key, value = %v, "number overridden from environment");
                *target = v;
            }
            Err(_) => warn!(key, raw = %raw, "unparseable numeric override, keeping file value"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = SystemConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.trading.symbols, vec!["EURUSD"]);
        assert_eq!(cfg.trading.timeframes, vec!["1", "5", "15"]);
        assert_eq!(cfg.event_bus.event_history_limit, 1000);
        assert_eq!(cfg.orchestrator.health_check_interval_secs, 60);
        assert!(cfg.risk.account_stop_loss.enabled);
        assert_eq!(cfg.automation.file_watcher_interval_secs, 5);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: SystemConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.services.data_fetching.nbr_bars, 3);
        assert!(cfg.services.trade_execution.enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "trading": { "symbols": ["XAUUSD", "BTCUSD"] } }"#;
        let cfg: SystemConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading.symbols, vec!["XAUUSD", "BTCUSD"]);
        assert_eq!(cfg.trading.timeframes, vec!["1", "5", "15"]);
        assert!(cfg.automation.file_watcher_enabled);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = SystemConfig::default();
        cfg.trading.symbols.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoSymbols)));

        let mut cfg = SystemConfig::default();
        cfg.trading.timeframes.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoTimeframes)));

        let mut cfg = SystemConfig::default();
        cfg.orchestrator.health_check_interval_secs = 5;
        assert!(cfg.validate().is_err());

        let mut cfg = SystemConfig::default();
        cfg.risk.max_position_size = 0.001;
        assert!(cfg.validate().is_err());

        let mut cfg = SystemConfig::default();
        cfg.services.trade_execution.execution_mode = "eventually".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = SystemConfig::default();
        cfg.automation.file_watcher_interval_secs = 61;
        assert!(cfg.validate().is_err());

        let mut cfg = SystemConfig::default();
        cfg.services.data_fetching.candle_index = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bool_parsing_accepts_documented_spellings() {
        for v in ["true", "TRUE", "1", "yes", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn env_overrides_lists_and_booleans() {
        let mut cfg = SystemConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("MERIDIAN_SYMBOLS", "xauusd, btcusd"),
            ("MERIDIAN_TIMEFRAMES", "5, 15"),
            ("MERIDIAN_AUTOMATION_ENABLED", "off"),
            ("MERIDIAN_AUTO_RESTART", "YES"),
        ]));

        assert_eq!(cfg.trading.symbols, vec!["XAUUSD", "BTCUSD"]);
        assert_eq!(cfg.trading.timeframes, vec!["5", "15"]);
        assert!(!cfg.automation.enabled);
        assert!(cfg.orchestrator.enable_auto_restart);
    }

    #[test]
    fn numeric_override_falls_back_on_parse_failure() {
        let mut cfg = SystemConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("MERIDIAN_DAILY_LOSS_LIMIT", "2500.5"),
            ("MERIDIAN_TICK_INTERVAL", "not-a-number"),
        ]));

        assert_eq!(cfg.risk.account_stop_loss.config.daily_loss_limit, 2500.5);
        // Unparseable value keeps the file value.
        assert_eq!(cfg.orchestrator.tick_interval_secs, default_tick_interval());
    }

    #[test]
    fn unparseable_boolean_keeps_file_value() {
        let mut cfg = SystemConfig::default();
        cfg.apply_overrides_from(lookup(&[("MERIDIAN_AUTOMATION_ENABLED", "sometimes")]));
        assert!(cfg.automation.enabled);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut cfg = SystemConfig::default();
        cfg.trading.symbols = vec!["XAUUSD".to_string()];
        cfg.orchestrator.tick_interval_secs = 7;
        cfg.save(&path).unwrap();

        let loaded = SystemConfig::load(&path).unwrap();
        assert_eq!(loaded.trading.symbols, vec!["XAUUSD"]);
        assert_eq!(loaded.orchestrator.tick_interval_secs, 7);
        // No tmp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = SystemConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = SystemConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn normalized_symbols_uppercase_and_trim() {
        let mut cfg = SystemConfig::default();
        cfg.trading.symbols = vec![" eurusd ".to_string(), "".to_string(), "btcusd".to_string()];
        assert_eq!(cfg.normalized_symbols(), vec!["EURUSD", "BTCUSD"]);
    }
}
