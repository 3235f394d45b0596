// =============================================================================
// Shared test fixtures: scripted collaborators and event collection
// =============================================================================

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::broker::{BrokerAdapter, BrokerResponse, CycleReport, PositionInfo, SymbolPrice};
use crate::bus::EventBus;
use crate::decision::Trades;
use crate::events::{Event, EventKind};
use crate::market::{Candle, DataSource};

pub fn bar_time(i: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap()
}

pub fn candle(i: i64, close: f64) -> Candle {
    Candle::new(bar_time(i), close - 0.5, close + 1.0, close - 1.0, close, 1_000.0)
}

/// Trend + cycle series matching the synthetic source's character.
pub fn trending_series(n: usize) -> Vec<Candle> {
    (0..n as i64)
        .map(|i| {
            let trend = 100.0 + i as f64 * 0.05;
            let cycle = 5.0 * (i as f64 * std::f64::consts::TAU / 50.0).sin();
            let noise = ((i * 2654435761) % 1000) as f64 / 1000.0 - 0.5;
            candle(i, trend + cycle + noise)
        })
        .collect()
}

/// Subscribe a collector to one event kind; returns the shared sink.
pub fn collect_events(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let handler_sink = sink.clone();
    bus.subscribe(
        kind,
        Arc::new(move |e| {
            handler_sink.lock().push(e.clone());
            Ok(())
        }),
    );
    sink
}

// ---------------------------------------------------------------------------
// Scripted data source
// ---------------------------------------------------------------------------

/// Data source returning pre-scripted frames per (symbol, timeframe). Each
/// `stream` call pops the next frame; an exhausted queue repeats the last
/// frame, and `fail_next` injects one transport error.
#[derive(Default)]
pub struct ScriptedDataSource {
    frames: Mutex<HashMap<(String, String), Vec<Vec<Candle>>>>,
    historical: Mutex<HashMap<(String, String), Vec<Candle>>>,
    fail_next: Mutex<bool>,
}

impl ScriptedDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, symbol: &str, timeframe: &str, bars: Vec<Candle>) {
        self.frames
            .lock()
            .entry((symbol.to_string(), timeframe.to_string()))
            .or_default()
            .push(bars);
    }

    pub fn set_historical(&self, symbol: &str, timeframe: &str, bars: Vec<Candle>) {
        self.historical
            .lock()
            .insert((symbol.to_string(), timeframe.to_string()), bars);
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }
}

impl DataSource for ScriptedDataSource {
    fn historical(&self, symbol: &str, timeframe: &str) -> Result<Vec<Candle>> {
        Ok(self
            .historical
            .lock()
            .get(&(symbol.to_string(), timeframe.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn stream(&self, symbol: &str, timeframe: &str, _nbr_bars: usize) -> Result<Vec<Candle>> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            anyhow::bail!("scripted stream failure");
        }
        let mut frames = self.frames.lock();
        let key = (symbol.to_string(), timeframe.to_string());
        let Some(queue) = frames.get_mut(&key) else {
            return Ok(Vec::new());
        };
        if queue.len() > 1 {
            Ok(queue.remove(0))
        } else {
            Ok(queue.first().cloned().unwrap_or_default())
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted broker
// ---------------------------------------------------------------------------

/// Broker double with programmable responses, layered over fixed position
/// and price tables. Used where the paper broker's real accounting gets in
/// the way of failure injection.
#[derive(Default)]
pub struct ScriptedBroker {
    pub positions: Mutex<Vec<PositionInfo>>,
    pub prices: Mutex<HashMap<String, f64>>,
    pub balance: Mutex<f64>,
    pub close_responses: Mutex<Vec<BrokerResponse>>,
    pub modify_responses: Mutex<Vec<BrokerResponse>>,
    pub close_calls: Mutex<Vec<(String, u64, Option<f64>)>>,
    pub modify_calls: Mutex<Vec<(String, u64, Option<f64>, Option<f64>)>>,
    pub cycle_reports: Mutex<Vec<CycleReport>>,
    pub cycle_calls: Mutex<Vec<Trades>>,
    pub fail_balance: Mutex<bool>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self {
            balance: Mutex::new(10_000.0),
            ..Self::default()
        }
    }

    pub fn set_price(&self, symbol: &str, bid: f64) {
        self.prices.lock().insert(symbol.to_string(), bid);
    }

    pub fn add_position(&self, info: PositionInfo) {
        self.positions.lock().push(info);
    }

    pub fn queue_close_response(&self, resp: BrokerResponse) {
        self.close_responses.lock().push(resp);
    }

    pub fn queue_modify_response(&self, resp: BrokerResponse) {
        self.modify_responses.lock().push(resp);
    }

    pub fn queue_cycle_report(&self, report: CycleReport) {
        self.cycle_reports.lock().push(report);
    }
}

impl BrokerAdapter for ScriptedBroker {
    fn balance(&self) -> Result<f64> {
        if *self.fail_balance.lock() {
            anyhow::bail!("scripted balance failure");
        }
        Ok(*self.balance.lock())
    }

    fn open_positions(&self) -> Result<Vec<PositionInfo>> {
        Ok(self.positions.lock().clone())
    }

    fn close_position(
        &self,
        symbol: &str,
        ticket: u64,
        volume: Option<f64>,
    ) -> Result<BrokerResponse> {
        self.close_calls
            .lock()
            .push((symbol.to_string(), ticket, volume));
        let mut queued = self.close_responses.lock();
        let resp = if queued.is_empty() {
            BrokerResponse::done("closed")
        } else {
            queued.remove(0)
        };
        if resp.is_done() {
            // Mirror the close in the position table.
            let mut positions = self.positions.lock();
            if let Some(idx) = positions.iter().position(|p| p.ticket == ticket) {
                match volume {
                    Some(v) if positions[idx].volume - v >= crate::broker::MIN_LOT => {
                        positions[idx].volume -= v;
                    }
                    _ => {
                        positions.remove(idx);
                    }
                }
            }
        }
        Ok(resp)
    }

    fn modify_position(
        &self,
        symbol: &str,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<BrokerResponse> {
        self.modify_calls
            .lock()
            .push((symbol.to_string(), ticket, stop_loss, take_profit));
        let mut queued = self.modify_responses.lock();
        let resp = if queued.is_empty() {
            BrokerResponse::done("modified")
        } else {
            queued.remove(0)
        };
        if resp.is_done() {
            let mut positions = self.positions.lock();
            if let Some(p) = positions.iter_mut().find(|p| p.ticket == ticket) {
                if stop_loss.is_some() {
                    p.stop_loss = stop_loss;
                }
                if take_profit.is_some() {
                    p.take_profit = take_profit;
                }
            }
        }
        Ok(resp)
    }

    fn symbol_price(&self, symbol: &str) -> Result<SymbolPrice> {
        let bid = self.prices.lock().get(symbol).copied().unwrap_or(0.0);
        Ok(SymbolPrice {
            bid,
            ask: bid + 0.02,
        })
    }

    fn execute_trading_cycle(&self, trades: &Trades) -> Result<CycleReport> {
        self.cycle_calls.lock().push(trades.clone());
        let mut queued = self.cycle_reports.lock();
        if queued.is_empty() {
            Ok(CycleReport {
                context: crate::broker::TradingContext::authorized(0.0),
                fills: Vec::new(),
                closed: Vec::new(),
                group_id: None,
            })
        } else {
            Ok(queued.remove(0))
        }
    }
}
