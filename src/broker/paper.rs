// =============================================================================
// Paper Broker — in-memory simulated broker
// =============================================================================
//
// Fills every authorized order instantly at the requested price, tracks
// positions and balance locally, and supports partial closes and stop/target
// modification. Used by the demo binary and as a realistic double in tests;
// block flags let tests force news/market/risk rejections.

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::{
    normalize_volume, BrokerAdapter, BrokerResponse, ClosedFill, CycleReport, EntryFill,
    PositionInfo, SymbolPrice, TradingContext,
};
use crate::decision::{Direction, Trades};

const DEFAULT_BALANCE: f64 = 10_000.0;
const DEFAULT_SPREAD: f64 = 0.02;

#[derive(Debug, Clone)]
struct PaperPosition {
    info: PositionInfo,
}

#[derive(Debug, Default)]
struct BlockFlags {
    news_block_active: bool,
    market_closing_soon: bool,
    risk_breached: bool,
}

struct Inner {
    balance: f64,
    realized_pnl: f64,
    next_ticket: u64,
    positions: HashMap<u64, PaperPosition>,
    prices: HashMap<String, f64>,
    blocks: BlockFlags,
}

/// Simulated broker backing the demo binary and the integration tests.
pub struct PaperBroker {
    inner: Mutex<Inner>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::with_balance(DEFAULT_BALANCE)
    }

    pub fn with_balance(balance: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                balance,
                realized_pnl: 0.0,
                next_ticket: 1000,
                positions: HashMap::new(),
                prices: HashMap::new(),
                blocks: BlockFlags::default(),
            }),
        }
    }

    /// Set the current bid for a symbol. Tests drive price paths with this.
    pub fn set_price(&self, symbol: &str, bid: f64) {
        self.inner.lock().prices.insert(symbol.to_string(), bid);
    }

    /// Force the news-block flag for the next trading cycles.
    pub fn set_news_block(&self, active: bool) {
        self.inner.lock().blocks.news_block_active = active;
    }

    pub fn set_market_closing(&self, active: bool) {
        self.inner.lock().blocks.market_closing_soon = active;
    }

    pub fn set_risk_breached(&self, active: bool) {
        self.inner.lock().blocks.risk_breached = active;
    }

    pub fn position_count(&self) -> usize {
        self.inner.lock().positions.len()
    }

    fn price_of(inner: &Inner, symbol: &str, fallback: f64) -> f64 {
        inner.prices.get(symbol).copied().unwrap_or(fallback)
    }

    fn pnl(direction: Direction, open: f64, close: f64, volume: f64) -> f64 {
        match direction {
            Direction::Long => (close - open) * volume,
            Direction::Short => (open - close) * volume,
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerAdapter for PaperBroker {
    fn balance(&self) -> Result<f64> {
        Ok(self.inner.lock().balance)
    }

    fn open_positions(&self) -> Result<Vec<PositionInfo>> {
        let inner = self.inner.lock();
        let mut positions: Vec<PositionInfo> =
            inner.positions.values().map(|p| p.info.clone()).collect();
        positions.sort_by_key(|p| p.ticket);
        Ok(positions)
    }

    fn close_position(
        &self,
        symbol: &str,
        ticket: u64,
        volume: Option<f64>,
    ) -> Result<BrokerResponse> {
        let mut inner = self.inner.lock();

        let Some(position) = inner.positions.get(&ticket).cloned() else {
            return Ok(BrokerResponse::rejected(format!(
                "position {ticket} not found"
            )));
        };
        if position.info.symbol != symbol {
            return Ok(BrokerResponse::rejected(format!(
                "ticket {ticket} does not belong to {symbol}"
            )));
        }

        let close_volume = volume.unwrap_or(position.info.volume);
        if close_volume <= 0.0 || close_volume > position.info.volume + 1e-9 {
            return Ok(BrokerResponse::rejected(format!(
                "invalid close volume {close_volume}"
            )));
        }

        let close_price = Self::price_of(&inner, symbol, position.info.price_open);
        let profit = Self::pnl(
            position.info.direction,
            position.info.price_open,
            close_price,
            close_volume,
        );
        inner.balance += profit;
        inner.realized_pnl += profit;

        let remaining = position.info.volume - close_volume;
        if remaining < crate::broker::MIN_LOT {
            inner.positions.remove(&ticket);
        } else if let Some(p) = inner.positions.get_mut(&ticket) {
            p.info.volume = remaining;
        }

        debug!(
            ticket,
            symbol,
            close_volume,
            close_price,
            profit,
            remaining,
            "paper close"
        );
        Ok(BrokerResponse::done("closed"))
    }

    fn modify_position(
        &self,
        symbol: &str,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<BrokerResponse> {
        let mut inner = self.inner.lock();
        let Some(position) = inner.positions.get_mut(&ticket) else {
            return Ok(BrokerResponse::rejected(format!(
                "position {ticket} not found"
            )));
        };
        if position.info.symbol != symbol {
            return Ok(BrokerResponse::rejected(format!(
                "ticket {ticket} does not belong to {symbol}"
            )));
        }
        if stop_loss.is_some() {
            position.info.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            position.info.take_profit = take_profit;
        }
        Ok(BrokerResponse::done("modified"))
    }

    fn symbol_price(&self, symbol: &str) -> Result<SymbolPrice> {
        let inner = self.inner.lock();
        let bid = Self::price_of(&inner, symbol, 0.0);
        if bid <= 0.0 {
            return Err(crate::errors::BrokerError::NoPrice {
                symbol: symbol.to_string(),
            }
            .into());
        }
        Ok(SymbolPrice {
            bid,
            ask: bid + DEFAULT_SPREAD,
        })
    }

    fn execute_trading_cycle(&self, trades: &Trades) -> Result<CycleReport> {
        let mut inner = self.inner.lock();

        let blocks = &inner.blocks;
        if blocks.news_block_active || blocks.market_closing_soon || blocks.risk_breached {
            let context = TradingContext {
                trade_authorized: false,
                news_block_active: blocks.news_block_active,
                market_closing_soon: blocks.market_closing_soon,
                risk_breached: blocks.risk_breached,
                total_pnl: inner.realized_pnl,
            };
            return Ok(CycleReport::blocked(context));
        }

        // ── Exits first: flatten matching positions ─────────────────────
        let mut closed = Vec::new();
        for exit in &trades.exits {
            let tickets: Vec<u64> = inner
                .positions
                .values()
                .filter(|p| {
                    p.info.symbol == exit.symbol
                        && p.info.magic == exit.magic
                        && p.info.direction == exit.direction
                })
                .map(|p| p.info.ticket)
                .collect();

            for ticket in tickets {
                let position = inner.positions.remove(&ticket).unwrap();
                let close_price =
                    Self::price_of(&inner, &position.info.symbol, position.info.price_open);
                let profit = Self::pnl(
                    position.info.direction,
                    position.info.price_open,
                    close_price,
                    position.info.volume,
                );
                inner.balance += profit;
                inner.realized_pnl += profit;
                closed.push(ClosedFill {
                    ticket,
                    direction: position.info.direction,
                    volume: position.info.volume,
                    profit,
                    close_price,
                    strategy_name: Some(exit.strategy_name.clone()),
                });
            }
        }

        // ── Entries ─────────────────────────────────────────────────────
        let mut fills = Vec::new();
        for entry in &trades.entries {
            let volume = normalize_volume(entry.position_size);
            if volume == 0.0 {
                debug!(
                    symbol = %entry.symbol,
                    requested = entry.position_size,
                    "paper entry skipped: volume below minimum lot"
                );
                continue;
            }

            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            // The fill price becomes the last-known quote for the symbol.
            inner
                .prices
                .entry(entry.symbol.clone())
                .or_insert(entry.entry_price);
            let take_profit = if entry.take_profit.level > 0.0 {
                Some(entry.take_profit.level)
            } else {
                None
            };

            inner.positions.insert(
                ticket,
                PaperPosition {
                    info: PositionInfo {
                        ticket,
                        symbol: entry.symbol.clone(),
                        direction: entry.direction,
                        volume,
                        price_open: entry.entry_price,
                        stop_loss: Some(entry.stop_loss.level),
                        take_profit,
                        magic: entry.magic,
                        comment: format!("{}:{}", entry.strategy_name, entry.magic),
                    },
                },
            );

            fills.push(EntryFill {
                ticket,
                strategy_name: entry.strategy_name.clone(),
                magic: entry.magic,
                direction: entry.direction,
                volume,
                price: entry.entry_price,
                stop_loss: entry.stop_loss.level,
                take_profit,
            });
        }

        let group_id = if fills.is_empty() {
            None
        } else {
            Some(Uuid::new_v4().to_string())
        };

        info!(
            entries = fills.len(),
            exits = closed.len(),
            balance = inner.balance,
            "paper trading cycle executed"
        );

        Ok(CycleReport {
            context: TradingContext::authorized(inner.realized_pnl),
            fills,
            closed,
            group_id,
        })
    }
}
