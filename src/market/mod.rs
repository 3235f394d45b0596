// =============================================================================
// Market data model and data-source seam
// =============================================================================

pub mod synthetic;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use synthetic::SyntheticDataSource;

/// A single OHLCV candle. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time of the bar. Monotonic within a series.
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Abstract market data source consumed by the data-fetch service.
///
/// `historical` seeds indicator/regime state at startup; `stream` returns the
/// most recent `nbr_bars` bars, latest last, including the currently forming
/// one.
pub trait DataSource: Send + Sync {
    fn historical(&self, symbol: &str, timeframe: &str) -> Result<Vec<Candle>>;

    fn stream(&self, symbol: &str, timeframe: &str, nbr_bars: usize) -> Result<Vec<Candle>>;
}

/// Parse a timeframe label ("1", "5", "15", ...) into its length in seconds.
pub fn timeframe_secs(timeframe: &str) -> i64 {
    timeframe.trim().parse::<i64>().unwrap_or(1).max(1) * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parsing() {
        assert_eq!(timeframe_secs("1"), 60);
        assert_eq!(timeframe_secs("5"), 300);
        assert_eq!(timeframe_secs("15"), 900);
        // Garbage falls back to one minute.
        assert_eq!(timeframe_secs("abc"), 60);
        assert_eq!(timeframe_secs("0"), 60);
    }
}
