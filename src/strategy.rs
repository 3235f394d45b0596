// =============================================================================
// Strategy seam — evaluation engine + entry manager
// =============================================================================
//
// The evaluator service treats both collaborators as opaque: a
// `StrategyEngine` turns recent enriched rows into per-strategy signals, and
// an `EntryManager` turns signals into fully-sized entry/exit decisions.
// The baseline implementations below keep the pipeline productive without a
// strategy DSL: a regime-momentum engine and an ATR-ladder entry manager.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use crate::decision::{
    Direction, EntryDecision, ExitDecision, StopLossSpec, TakeProfitSpec, TpTarget, Trades,
};
use crate::indicators::{EnrichedRow, RecentRows};
use crate::regime::Regime;

/// Per-strategy evaluation outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategySignal {
    pub entry_long: bool,
    pub entry_short: bool,
    pub exit_long: bool,
    pub exit_short: bool,
    pub confidence: f64,
}

/// All strategies' signals for one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct StrategyResults {
    pub strategies: HashMap<String, StrategySignal>,
}

/// Opaque strategy evaluation engine.
pub trait StrategyEngine: Send + Sync {
    fn evaluate(&self, rows: &RecentRows) -> Result<StrategyResults>;

    fn strategy_names(&self) -> Vec<String>;
}

/// Opaque sizing/decision layer between signals and the executor.
pub trait EntryManager: Send + Sync {
    fn manage_trades(
        &self,
        results: &StrategyResults,
        rows: &RecentRows,
        account_balance: Option<f64>,
    ) -> Result<Trades>;
}

// =============================================================================
// Baseline strategy engine
// =============================================================================

/// Trades with the committed regime on one timeframe: long in bull regimes,
/// short in bear regimes, flat otherwise. Transition bars are skipped.
pub struct RegimeMomentumStrategy {
    name: String,
    timeframe: String,
    min_confidence: f64,
}

impl RegimeMomentumStrategy {
    pub fn new(name: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeframe: timeframe.into(),
            min_confidence: 0.4,
        }
    }

    fn signal_from(&self, row: &EnrichedRow) -> StrategySignal {
        let mut signal = StrategySignal {
            confidence: row.regime_confidence,
            ..StrategySignal::default()
        };

        match row.regime {
            Regime::BullExpansion | Regime::BullContraction => {
                signal.exit_short = true;
                if !row.is_transition && row.regime_confidence >= self.min_confidence {
                    signal.entry_long = true;
                }
            }
            Regime::BearExpansion | Regime::BearContraction => {
                signal.exit_long = true;
                if !row.is_transition && row.regime_confidence >= self.min_confidence {
                    signal.entry_short = true;
                }
            }
            Regime::NeutralExpansion | Regime::NeutralContraction | Regime::WarmingUp => {}
        }
        signal
    }
}

impl StrategyEngine for RegimeMomentumStrategy {
    fn evaluate(&self, rows: &RecentRows) -> Result<StrategyResults> {
        let mut results = StrategyResults::default();

        let Some(tf_rows) = rows.get(&self.timeframe) else {
            return Ok(results);
        };
        let Some(last) = tf_rows.last() else {
            return Ok(results);
        };

        let signal = self.signal_from(last);
        debug!(
            strategy = %self.name,
            timeframe = %self.timeframe,
            regime = %last.regime,
            confidence = last.regime_confidence,
            entry_long = signal.entry_long,
            entry_short = signal.entry_short,
            "strategy evaluated"
        );
        results.strategies.insert(self.name.clone(), signal);
        Ok(results)
    }

    fn strategy_names(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

// =============================================================================
// Baseline entry manager
// =============================================================================

/// Sizes entries from account risk and builds a two-rung ATR take-profit
/// ladder with breakeven after the first rung.
pub struct LadderEntryManager {
    symbol: String,
    risk_pct: f64,
    sl_atr_mult: f64,
    tp1_atr_mult: f64,
    tp2_atr_mult: f64,
    fallback_balance: f64,
}

impl LadderEntryManager {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            risk_pct: 1.0,
            sl_atr_mult: 1.5,
            tp1_atr_mult: 2.5,
            tp2_atr_mult: 4.0,
            fallback_balance: 10_000.0,
        }
    }

    /// Latest row across all timeframes (by candle time).
    fn latest_row(rows: &RecentRows) -> Option<Arc<EnrichedRow>> {
        rows.values()
            .filter_map(|r| r.last().cloned())
            .max_by_key(|r| r.candle.time)
    }

    /// Stable per-strategy magic number.
    fn magic_of(strategy_name: &str) -> u64 {
        let h = strategy_name.bytes().fold(0xcbf29ce484222325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x100000001b3)
        });
        100_000 + h % 900_000
    }

    fn build_entry(
        &self,
        strategy_name: &str,
        direction: Direction,
        row: &EnrichedRow,
        account_balance: Option<f64>,
    ) -> EntryDecision {
        let price = row.candle.close;
        // ATR drives stop distance; fall back to 0.5% of price when the
        // indicator is not yet available.
        let atr = row
            .indicator("atr")
            .filter(|a| *a > 0.0)
            .unwrap_or(price.abs() * 0.005);

        let sl_distance = atr * self.sl_atr_mult;
        let (sl, tp1, tp2) = match direction {
            Direction::Long => (
                price - sl_distance,
                price + atr * self.tp1_atr_mult,
                price + atr * self.tp2_atr_mult,
            ),
            Direction::Short => (
                price + sl_distance,
                price - atr * self.tp1_atr_mult,
                price - atr * self.tp2_atr_mult,
            ),
        };

        let balance = account_balance.unwrap_or(self.fallback_balance);
        let risk_amount = balance * self.risk_pct / 100.0;
        let position_size = if sl_distance > 0.0 {
            risk_amount / sl_distance
        } else {
            0.0
        };

        EntryDecision {
            symbol: self.symbol.clone(),
            strategy_name: strategy_name.to_string(),
            magic: Self::magic_of(strategy_name),
            direction,
            entry_price: price,
            position_size,
            stop_loss: StopLossSpec {
                kind: "atr".to_string(),
                level: sl,
            },
            take_profit: TakeProfitSpec {
                kind: "atr_ladder".to_string(),
                level: tp2,
                ladder: vec![
                    TpTarget {
                        level: tp1,
                        percent: 50.0,
                        move_stop: true,
                    },
                    TpTarget {
                        level: tp2,
                        percent: 50.0,
                        move_stop: false,
                    },
                ],
            },
            decision_time: Utc::now(),
        }
    }
}

impl EntryManager for LadderEntryManager {
    fn manage_trades(
        &self,
        results: &StrategyResults,
        rows: &RecentRows,
        account_balance: Option<f64>,
    ) -> Result<Trades> {
        let mut trades = Trades::default();
        let Some(row) = Self::latest_row(rows) else {
            return Ok(trades);
        };

        // Deterministic iteration order for reproducible batches.
        let mut names: Vec<&String> = results.strategies.keys().collect();
        names.sort();

        for name in names {
            let signal = &results.strategies[name];

            if signal.entry_long {
                trades
                    .entries
                    .push(self.build_entry(name, Direction::Long, &row, account_balance));
            }
            if signal.entry_short {
                trades
                    .entries
                    .push(self.build_entry(name, Direction::Short, &row, account_balance));
            }
            if signal.exit_long {
                trades.exits.push(ExitDecision {
                    symbol: self.symbol.clone(),
                    strategy_name: name.to_string(),
                    magic: Self::magic_of(name),
                    direction: Direction::Long,
                    decision_time: Utc::now(),
                });
            }
            if signal.exit_short {
                trades.exits.push(ExitDecision {
                    symbol: self.symbol.clone(),
                    strategy_name: name.to_string(),
                    magic: Self::magic_of(name),
                    direction: Direction::Short,
                    decision_time: Utc::now(),
                });
            }
        }

        Ok(trades)
    }
}
