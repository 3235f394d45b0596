// =============================================================================
// MACD (12, 26, 9) — incremental with honest histogram availability
// =============================================================================
//
// line   = EMA(fast) - EMA(slow)
// signal = EMA(signal_period) over line
// hist   = line - signal
//
// The histogram is *unavailable* (None) until the signal EMA has absorbed at
// least one prior line value; substituting 0 would inject a fake neutral
// reading into the direction score.
// =============================================================================

use crate::indicators::ema::Ema;

/// One MACD update result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub line: f64,
    pub signal: f64,
    /// None while the signal EMA is being initialised.
    pub hist: Option<f64>,
}

/// Incremental MACD state.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
        }
    }

    pub fn standard() -> Self {
        Self::new(12, 26, 9)
    }

    /// Feed one close.
    pub fn update(&mut self, close: f64) -> MacdOutput {
        let line = self.fast.update(close) - self.slow.update(close);
        let signal_ready = self.signal.value().is_some();
        let signal = self.signal.update(line);
        MacdOutput {
            line,
            signal,
            hist: if signal_ready {
                Some(line - signal)
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hist_absent_on_first_bar() {
        let mut macd = Macd::standard();
        let out = macd.update(100.0);
        assert_eq!(out.hist, None);
        // First close seeds both EMAs identically.
        assert_eq!(out.line, 0.0);
    }

    #[test]
    fn hist_present_from_second_bar() {
        let mut macd = Macd::standard();
        macd.update(100.0);
        let out = macd.update(101.0);
        assert!(out.hist.is_some());
    }

    #[test]
    fn rising_prices_turn_hist_positive() {
        let mut macd = Macd::standard();
        let mut last = None;
        for i in 0..60 {
            last = macd.update(100.0 + i as f64).hist;
        }
        assert!(last.unwrap() > 0.0);
    }

    #[test]
    fn falling_prices_turn_hist_negative() {
        let mut macd = Macd::standard();
        let mut last = None;
        for i in 0..60 {
            last = macd.update(200.0 - i as f64).hist;
        }
        assert!(last.unwrap() < 0.0);
    }

    #[test]
    fn flat_prices_keep_hist_near_zero() {
        let mut macd = Macd::standard();
        let mut last = None;
        for _ in 0..60 {
            last = macd.update(100.0).hist;
        }
        assert!(last.unwrap().abs() < 1e-9);
    }
}
