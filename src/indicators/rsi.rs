// =============================================================================
// Relative Strength Index (RSI) — Wilder smoothing, incremental
// =============================================================================
//
// Per-bar delta of consecutive closes is split into gain/loss. Average gain
// and average loss use Wilder smoothing (first delta initialises).
//
//   RS  = avg_gain / avg_loss
//   RSI = 100 - 100 / (1 + RS)
//
// Edge cases:
//   - no previous close yet        => RSI = 50 (neutral)
//   - avg_loss == 0, avg_gain > 0  => RSI = 100
//   - both averages zero           => RSI = 50
// =============================================================================

use crate::indicators::atr::Wilder;

/// Incremental RSI state.
#[derive(Debug, Clone)]
pub struct Rsi {
    avg_gain: Wilder,
    avg_loss: Wilder,
    prev_close: Option<f64>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            avg_gain: Wilder::new(period),
            avg_loss: Wilder::new(period),
            prev_close: None,
        }
    }

    /// Feed one close and return the RSI in [0, 100].
    pub fn update(&mut self, close: f64) -> f64 {
        let rsi = match self.prev_close {
            None => 50.0,
            Some(prev) => {
                let delta = close - prev;
                let gain = if delta > 0.0 { delta } else { 0.0 };
                let loss = if delta < 0.0 { -delta } else { 0.0 };
                let avg_gain = self.avg_gain.update(gain);
                let avg_loss = self.avg_loss.update(loss);
                Self::from_averages(avg_gain, avg_loss)
            }
        };
        self.prev_close = Some(close);
        rsi
    }

    fn from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 && avg_gain == 0.0 {
            50.0
        } else if avg_loss == 0.0 {
            100.0
        } else {
            let rs = avg_gain / avg_loss;
            100.0 - 100.0 / (1.0 + rs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_bar_is_neutral() {
        let mut rsi = Rsi::new(14);
        assert_eq!(rsi.update(100.0), 50.0);
    }

    #[test]
    fn all_gains_saturate_at_100() {
        let mut rsi = Rsi::new(14);
        let mut last = 0.0;
        for i in 0..30 {
            last = rsi.update(100.0 + i as f64);
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn all_losses_drop_to_zero() {
        let mut rsi = Rsi::new(14);
        let mut last = 100.0;
        for i in 0..30 {
            last = rsi.update(100.0 - i as f64);
        }
        assert!(last.abs() < 1e-9, "expected 0, got {last}");
    }

    #[test]
    fn flat_market_stays_neutral() {
        let mut rsi = Rsi::new(14);
        for _ in 0..30 {
            assert_eq!(rsi.update(100.0), 50.0);
        }
    }

    #[test]
    fn range_bounds_hold() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let mut rsi = Rsi::new(14);
        for c in closes {
            let v = rsi.update(c);
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn incremental_matches_itself() {
        // Two fresh instances over the same stream produce identical output.
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let mut a = Rsi::new(14);
        let mut b = Rsi::new(14);
        for &c in &closes {
            assert_eq!(a.update(c), b.update(c));
        }
    }
}
