// =============================================================================
// Synthetic Data Source — deterministic trend + cycle price generator
// =============================================================================
//
// Produces a reproducible candle series per (symbol, timeframe): a slow
// linear trend, a sine cycle, and hash-derived pseudo-noise. The same bar
// index always yields the same candle, which makes the demo binary runnable
// without an exchange and gives tests a predictable series.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use crate::market::{timeframe_secs, Candle, DataSource};

/// Number of bars returned by `historical`.
const HISTORICAL_BARS: usize = 600;

/// Deterministic in-process data source.
pub struct SyntheticDataSource {
    /// Base price offset added per symbol so different symbols do not overlap.
    base_price: f64,
    /// Fixed origin for bar index 0.
    origin: DateTime<Utc>,
}

impl SyntheticDataSource {
    pub fn new() -> Self {
        Self {
            base_price: 100.0,
            origin: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    /// Splitmix-style hash for reproducible per-bar noise.
    fn noise(seed: u64) -> f64 {
        let mut z = seed.wrapping_add(0x9e3779b97f4a7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^= z >> 31;
        // Map to [-1, 1).
        (z as f64 / u64::MAX as f64) * 2.0 - 1.0
    }

    fn symbol_seed(symbol: &str) -> u64 {
        symbol
            .bytes()
            .fold(0xcbf29ce484222325u64, |h, b| {
                (h ^ b as u64).wrapping_mul(0x100000001b3)
            })
    }

    fn bar_at(&self, symbol: &str, timeframe: &str, index: i64) -> Candle {
        let seed = Self::symbol_seed(symbol);
        let base = self.base_price + (seed % 400) as f64;

        let i = index as f64;
        let trend = base + i * 0.05;
        let cycle = 5.0 * (i * std::f64::consts::TAU / 50.0).sin();
        let noise = Self::noise(seed ^ index as u64);

        let close = trend + cycle + noise;
        let open = close - Self::noise(seed ^ (index as u64).wrapping_mul(3)) * 0.5;
        let spread = Self::noise(seed ^ (index as u64).wrapping_mul(7)).abs() + 0.1;
        let high = open.max(close) + spread;
        let low = open.min(close) - spread;
        let volume = 1_000.0 + Self::noise(seed ^ (index as u64).wrapping_mul(11)).abs() * 500.0;

        let secs = timeframe_secs(timeframe);
        let time = self.origin + chrono::Duration::seconds(index * secs);
        Candle::new(time, open, high, low, close, volume)
    }

    /// Index of the currently forming bar for the given timeframe.
    fn current_index(&self, timeframe: &str) -> i64 {
        let secs = timeframe_secs(timeframe);
        let elapsed = Utc::now().timestamp() - self.origin.timestamp();
        (elapsed / secs).max(HISTORICAL_BARS as i64)
    }
}

impl Default for SyntheticDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSource for SyntheticDataSource {
    fn historical(&self, symbol: &str, timeframe: &str) -> Result<Vec<Candle>> {
        let end = self.current_index(timeframe);
        let start = end - HISTORICAL_BARS as i64;
        Ok((start..end)
            .map(|i| self.bar_at(symbol, timeframe, i))
            .collect())
    }

    fn stream(&self, symbol: &str, timeframe: &str, nbr_bars: usize) -> Result<Vec<Candle>> {
        let end = self.current_index(timeframe) + 1; // include the forming bar
        let start = end - nbr_bars as i64;
        Ok((start..end)
            .map(|i| self.bar_at(symbol, timeframe, i))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_are_deterministic() {
        let src = SyntheticDataSource::new();
        let a = src.bar_at("EURUSD", "5", 42);
        let b = src.bar_at("EURUSD", "5", 42);
        assert_eq!(a, b);
    }

    #[test]
    fn symbols_diverge() {
        let src = SyntheticDataSource::new();
        let a = src.bar_at("EURUSD", "5", 42);
        let b = src.bar_at("XAUUSD", "5", 42);
        assert_ne!(a.close, b.close);
    }

    #[test]
    fn ohlc_is_consistent() {
        let src = SyntheticDataSource::new();
        for i in 0..200 {
            let c = src.bar_at("BTCUSD", "1", i);
            assert!(c.high >= c.open.max(c.close), "high below body at {i}");
            assert!(c.low <= c.open.min(c.close), "low above body at {i}");
            assert!(c.volume > 0.0);
        }
    }

    #[test]
    fn stream_is_ordered_and_sized() {
        let src = SyntheticDataSource::new();
        let bars = src.stream("EURUSD", "1", 5).unwrap();
        assert_eq!(bars.len(), 5);
        for w in bars.windows(2) {
            assert!(w[1].time > w[0].time);
        }
    }

    #[test]
    fn historical_precedes_stream() {
        let src = SyntheticDataSource::new();
        let hist = src.historical("EURUSD", "1").unwrap();
        let stream = src.stream("EURUSD", "1", 3).unwrap();
        assert_eq!(hist.len(), HISTORICAL_BARS);
        assert!(hist.last().unwrap().time <= stream.first().unwrap().time);
    }
}
