// =============================================================================
// Trade decision model
// =============================================================================
//
// The strategy evaluator produces a `Trades` batch per tick: ordered entry
// decisions and ordered exit decisions, handed to the trade executor as one
// unit. Take-profit ladders ride on entry decisions and later feed the
// position monitor through `TradesExecuted` metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn is_long(self) -> bool {
        self == Self::Long
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// One rung of a take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TpTarget {
    /// Price level that triggers this rung.
    pub level: f64,
    /// Percentage of the *initial* volume to close when hit (0-100).
    pub percent: f64,
    /// Move the stop loss to breakeven after this rung fills.
    pub move_stop: bool,
}

/// How a stop-loss level was derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossSpec {
    /// e.g. "fixed", "atr".
    pub kind: String,
    pub level: f64,
}

/// Take-profit specification: a primary level plus an optional ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitSpec {
    pub kind: String,
    pub level: f64,
    /// Multi-target ladder in execution order. Empty means single target.
    #[serde(default)]
    pub ladder: Vec<TpTarget>,
}

/// A fully-sized entry decision ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDecision {
    pub symbol: String,
    pub strategy_name: String,
    /// Broker-side integer tag identifying the owning strategy.
    pub magic: u64,
    pub direction: Direction,
    pub entry_price: f64,
    pub position_size: f64,
    pub stop_loss: StopLossSpec,
    pub take_profit: TakeProfitSpec,
    pub decision_time: DateTime<Utc>,
}

/// A decision to flatten the strategy's exposure in one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub symbol: String,
    pub strategy_name: String,
    pub magic: u64,
    pub direction: Direction,
    pub decision_time: DateTime<Utc>,
}

/// Atomic per-tick batch of decisions. Order within each list is execution
/// order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trades {
    pub entries: Vec<EntryDecision>,
    pub exits: Vec<ExitDecision>,
}

impl Trades {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.exits.is_empty()
    }

    /// Copy of this batch with all entries removed (automation gating).
    pub fn exits_only(&self) -> Self {
        Self {
            entries: Vec::new(),
            exits: self.exits.clone(),
        }
    }
}
