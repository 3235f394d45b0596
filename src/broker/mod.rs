// =============================================================================
// Broker adapter seam
// =============================================================================
//
// The engine never talks to an exchange directly: everything goes through
// `BrokerAdapter`. Broker-level rejections travel inside `BrokerResponse`
// (retcode != 10009); transport failures are `Err` and surface as rejection
// events or next-tick retries in the owning service.

pub mod paper;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::decision::{Direction, Trades};

pub use paper::PaperBroker;

/// Broker return code denoting success.
pub const RETCODE_DONE: i32 = 10009;
/// Generic broker rejection code used by the paper broker.
pub const RETCODE_REJECT: i32 = 10013;

/// Smallest volume increment accepted by the broker.
pub const LOT_STEP: f64 = 0.01;
/// Smallest tradable volume.
pub const MIN_LOT: f64 = 0.01;

/// Round a requested volume down to the broker lot grid. Volumes below the
/// minimum lot normalise to 0 (nothing to send).
pub fn normalize_volume(volume: f64) -> f64 {
    if !volume.is_finite() || volume < MIN_LOT {
        return 0.0;
    }
    ((volume / LOT_STEP) + 1e-9).floor() * LOT_STEP
}

/// Broker-side view of an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub price_open: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub magic: u64,
    pub comment: String,
}

/// Result of a close/modify request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerResponse {
    pub retcode: i32,
    pub comment: String,
}

impl BrokerResponse {
    pub fn done(comment: impl Into<String>) -> Self {
        Self {
            retcode: RETCODE_DONE,
            comment: comment.into(),
        }
    }

    pub fn rejected(comment: impl Into<String>) -> Self {
        Self {
            retcode: RETCODE_REJECT,
            comment: comment.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.retcode == RETCODE_DONE
    }
}

/// Current quote for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolPrice {
    pub bid: f64,
    pub ask: f64,
}

/// Authorization flags evaluated inside the broker's trading cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingContext {
    pub trade_authorized: bool,
    pub news_block_active: bool,
    pub market_closing_soon: bool,
    pub risk_breached: bool,
    pub total_pnl: f64,
}

impl TradingContext {
    pub fn authorized(total_pnl: f64) -> Self {
        Self {
            trade_authorized: true,
            news_block_active: false,
            market_closing_soon: false,
            risk_breached: false,
            total_pnl,
        }
    }
}

/// One filled entry order.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFill {
    pub ticket: u64,
    pub strategy_name: String,
    pub magic: u64,
    pub direction: Direction,
    pub volume: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
}

/// One position closed by an exit decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedFill {
    pub ticket: u64,
    pub direction: Direction,
    pub volume: f64,
    pub profit: f64,
    pub close_price: f64,
    pub strategy_name: Option<String>,
}

/// Outcome of one trading cycle: the authorization context plus what was
/// actually filled and closed.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub context: TradingContext,
    pub fills: Vec<EntryFill>,
    pub closed: Vec<ClosedFill>,
    pub group_id: Option<String>,
}

impl CycleReport {
    pub fn blocked(context: TradingContext) -> Self {
        Self {
            context,
            fills: Vec::new(),
            closed: Vec::new(),
            group_id: None,
        }
    }
}

/// Abstract broker consumed by the execution and monitoring services.
pub trait BrokerAdapter: Send + Sync {
    fn balance(&self) -> Result<f64>;

    fn open_positions(&self) -> Result<Vec<PositionInfo>>;

    /// Close a position, optionally only `volume` of it.
    fn close_position(&self, symbol: &str, ticket: u64, volume: Option<f64>)
        -> Result<BrokerResponse>;

    fn modify_position(
        &self,
        symbol: &str,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<BrokerResponse>;

    fn symbol_price(&self, symbol: &str) -> Result<SymbolPrice>;

    /// Composite entry/exit execution including the broker's own risk checks.
    fn execute_trading_cycle(&self, trades: &Trades) -> Result<CycleReport>;
}
