// =============================================================================
// Event family — the closed set of messages flowing over the bus
// =============================================================================
//
// Every event carries the common envelope (id, timestamp, optional
// correlation id) plus one payload variant. `EventKind` is the discriminant
// used as the subscription key; the bus never needs reflection. Heavy
// payloads (bar frames, recent rows, trade batches) sit behind `Arc` so
// events clone cheaply into the history ring.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::{Direction, Trades, TpTarget};
use crate::indicators::{EnrichedRow, RecentRows};
use crate::market::Candle;
use crate::regime::Regime;

/// Requested automation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomationAction {
    Enable,
    Disable,
    Query,
}

impl AutomationAction {
    /// Parse a toggle-file command (already trimmed and upper-cased).
    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "ENABLE" => Some(Self::Enable),
            "DISABLE" => Some(Self::Disable),
            "QUERY" => Some(Self::Query),
            _ => None,
        }
    }
}

impl std::fmt::Display for AutomationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enable => write!(f, "ENABLE"),
            Self::Disable => write!(f, "DISABLE"),
            Self::Query => write!(f, "QUERY"),
        }
    }
}

/// Execution metadata attached to `TradesExecuted`; `tickets` is the
/// authoritative list the position monitor tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeMetadata {
    pub tp_targets: Vec<TpTarget>,
    pub tickets: Vec<u64>,
    pub group_id: Option<String>,
}

/// Discriminant of the event family, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataFetched,
    NewCandle,
    DataFetchError,
    IndicatorsCalculated,
    RegimeChanged,
    IndicatorError,
    EntrySignal,
    ExitSignal,
    TradesReady,
    StrategyEvaluationError,
    OrderPlaced,
    OrderRejected,
    PositionClosed,
    TradesExecuted,
    TradingAuthorized,
    TradingBlocked,
    RiskLimitBreached,
    TpLevelHit,
    PositionPartiallyClosed,
    StopLossMoved,
    ToggleAutomation,
    AutomationStateChanged,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Payloads, one variant per concrete event type.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A frame of bars was fetched for one timeframe.
    DataFetched {
        symbol: String,
        timeframe: String,
        bars: Arc<Vec<Candle>>,
        num_bars: usize,
    },
    /// A new closed candle was detected.
    NewCandle {
        symbol: String,
        timeframe: String,
        candle: Candle,
    },
    DataFetchError {
        symbol: String,
        timeframe: String,
        error: String,
    },
    /// Indicators + regime computed for a new candle.
    IndicatorsCalculated {
        symbol: String,
        timeframe: String,
        row: Arc<EnrichedRow>,
        recent_rows: RecentRows,
    },
    /// The committed regime changed on a timeframe.
    RegimeChanged {
        symbol: String,
        timeframe: String,
        old_regime: Regime,
        new_regime: Regime,
        confidence: f64,
        is_transition: bool,
    },
    IndicatorError {
        symbol: String,
        timeframe: String,
        error: String,
    },
    EntrySignal {
        strategy_name: String,
        symbol: String,
        direction: Direction,
        entry_price: Option<f64>,
    },
    ExitSignal {
        strategy_name: String,
        symbol: String,
        direction: Direction,
        reason: String,
    },
    /// A complete decision batch ready for execution.
    TradesReady {
        symbol: String,
        trades: Arc<Trades>,
        num_entries: usize,
        num_exits: usize,
    },
    StrategyEvaluationError {
        symbol: String,
        error: String,
    },
    OrderPlaced {
        ticket: u64,
        symbol: String,
        direction: Direction,
        volume: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: Option<f64>,
        strategy_name: Option<String>,
        magic: Option<u64>,
    },
    OrderRejected {
        symbol: String,
        direction: Direction,
        reason: String,
        strategy_name: Option<String>,
    },
    PositionClosed {
        ticket: u64,
        symbol: String,
        direction: Direction,
        volume: f64,
        profit: f64,
        close_price: f64,
        strategy_name: Option<String>,
        reason: String,
    },
    /// Entry execution completed; feeds the position monitor.
    TradesExecuted {
        symbol: String,
        direction: Direction,
        total_volume: f64,
        order_count: usize,
        strategy_name: Option<String>,
        metadata: TradeMetadata,
    },
    TradingAuthorized {
        symbol: String,
        reason: String,
    },
    TradingBlocked {
        symbol: String,
        reasons: Vec<String>,
    },
    RiskLimitBreached {
        limit_type: String,
        current_value: f64,
        limit_value: f64,
        symbol: Option<String>,
    },
    TpLevelHit {
        symbol: String,
        ticket: u64,
        tp_level: f64,
        current_price: f64,
        percent_to_close: f64,
        move_stop: bool,
    },
    PositionPartiallyClosed {
        symbol: String,
        ticket: u64,
        closed_volume: f64,
        remaining_volume: f64,
        close_price: f64,
        profit: f64,
        tp_level: f64,
    },
    StopLossMoved {
        symbol: String,
        ticket: u64,
        old_stop_loss: Option<f64>,
        new_stop_loss: f64,
        reason: String,
    },
    ToggleAutomation {
        action: AutomationAction,
        reason: String,
        requested_by: String,
    },
    AutomationStateChanged {
        enabled: bool,
        previous_state: Option<bool>,
        reason: String,
        changed_at: DateTime<Utc>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DataFetched { .. } => EventKind::DataFetched,
            Self::NewCandle { .. } => EventKind::NewCandle,
            Self::DataFetchError { .. } => EventKind::DataFetchError,
            Self::IndicatorsCalculated { .. } => EventKind::IndicatorsCalculated,
            Self::RegimeChanged { .. } => EventKind::RegimeChanged,
            Self::IndicatorError { .. } => EventKind::IndicatorError,
            Self::EntrySignal { .. } => EventKind::EntrySignal,
            Self::ExitSignal { .. } => EventKind::ExitSignal,
            Self::TradesReady { .. } => EventKind::TradesReady,
            Self::StrategyEvaluationError { .. } => EventKind::StrategyEvaluationError,
            Self::OrderPlaced { .. } => EventKind::OrderPlaced,
            Self::OrderRejected { .. } => EventKind::OrderRejected,
            Self::PositionClosed { .. } => EventKind::PositionClosed,
            Self::TradesExecuted { .. } => EventKind::TradesExecuted,
            Self::TradingAuthorized { .. } => EventKind::TradingAuthorized,
            Self::TradingBlocked { .. } => EventKind::TradingBlocked,
            Self::RiskLimitBreached { .. } => EventKind::RiskLimitBreached,
            Self::TpLevelHit { .. } => EventKind::TpLevelHit,
            Self::PositionPartiallyClosed { .. } => EventKind::PositionPartiallyClosed,
            Self::StopLossMoved { .. } => EventKind::StopLossMoved,
            Self::ToggleAutomation { .. } => EventKind::ToggleAutomation,
            Self::AutomationStateChanged { .. } => EventKind::AutomationStateChanged,
        }
    }
}

/// An immutable event: common envelope + payload. Handlers must never mutate
/// what an event points at.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(payload: EventPayload, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::new(payload)
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_payload() {
        let e = Event::new(EventPayload::TradingAuthorized {
            symbol: "EURUSD".to_string(),
            reason: "all_checks_passed".to_string(),
        });
        assert_eq!(e.kind(), EventKind::TradingAuthorized);
    }

    #[test]
    fn event_ids_are_unique() {
        let a = Event::new(EventPayload::TradingAuthorized {
            symbol: "EURUSD".to_string(),
            reason: "x".to_string(),
        });
        let b = Event::new(EventPayload::TradingAuthorized {
            symbol: "EURUSD".to_string(),
            reason: "x".to_string(),
        });
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn correlation_id_is_carried() {
        let e = Event::with_correlation(
            EventPayload::ToggleAutomation {
                action: AutomationAction::Query,
                reason: "test".to_string(),
                requested_by: "tests".to_string(),
            },
            "corr-1",
        );
        assert_eq!(e.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn automation_action_parsing() {
        assert_eq!(AutomationAction::parse("ENABLE"), Some(AutomationAction::Enable));
        assert_eq!(AutomationAction::parse("DISABLE"), Some(AutomationAction::Disable));
        assert_eq!(AutomationAction::parse("QUERY"), Some(AutomationAction::Query));
        assert_eq!(AutomationAction::parse("enable"), None);
        assert_eq!(AutomationAction::parse(""), None);
    }

    #[test]
    fn kind_display_is_stable() {
        assert_eq!(EventKind::NewCandle.to_string(), "NewCandle");
        assert_eq!(EventKind::TradesReady.to_string(), "TradesReady");
    }
}
