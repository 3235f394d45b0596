// =============================================================================
// Incremental indicator stack
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod frame;
pub mod macd;
pub mod rsi;

pub use frame::{EnrichedRow, RecentRows, RowBuffer, DEFAULT_RECENT_ROWS};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::market::Candle;

/// Configured indicator set computed per candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub ema_periods: Vec<usize>,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub bollinger_period: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            ema_periods: vec![20, 50, 200],
            rsi_period: 14,
            atr_period: 14,
            bollinger_period: 20,
        }
    }
}

/// Composed incremental indicator state for one (symbol, timeframe).
///
/// One `update` per closed candle produces the full indicator map for that
/// candle. Unavailable values (e.g. the MACD histogram while its signal EMA
/// initialises) are simply absent from the map.
#[derive(Debug, Clone)]
pub struct IndicatorStack {
    emas: Vec<(usize, ema::Ema)>,
    rsi: rsi::Rsi,
    atr: atr::Atr,
    bb: bollinger::BollingerWidth,
    macd: macd::Macd,
    prev_close: Option<f64>,
}

impl IndicatorStack {
    pub fn new(cfg: &StackConfig) -> Self {
        Self {
            emas: cfg
                .ema_periods
                .iter()
                .map(|&p| (p, ema::Ema::new(p)))
                .collect(),
            rsi: rsi::Rsi::new(cfg.rsi_period),
            atr: atr::Atr::new(cfg.atr_period),
            bb: bollinger::BollingerWidth::new(cfg.bollinger_period),
            macd: macd::Macd::standard(),
            prev_close: None,
        }
    }

    /// Feed one closed candle, returning the indicator values for it.
    pub fn update(&mut self, bar: &Candle) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();

        for (period, ema) in &mut self.emas {
            out.insert(format!("ema_{period}"), ema.update(bar.close));
        }

        out.insert("rsi".to_string(), self.rsi.update(bar.close));
        out.insert(
            "atr".to_string(),
            self.atr.update(bar.high, bar.low, self.prev_close),
        );
        out.insert("bb_width".to_string(), self.bb.update(bar.close));

        let macd = self.macd.update(bar.close);
        out.insert("macd_line".to_string(), macd.line);
        out.insert("macd_signal".to_string(), macd.signal);
        if let Some(hist) = macd.hist {
            out.insert("macd_hist".to_string(), hist);
        }

        self.prev_close = Some(bar.close);
        out
    }
}
