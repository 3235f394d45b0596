// =============================================================================
// Bollinger Band Width — incremental over a bounded close window
// =============================================================================
//
// Keeps the last `period` closes (fewer during warm-in) and reports the
// normalised band width:
//
//   width = (upper - lower) / mean = 4 * stddev / mean
//
// Returns 0 when the window is empty or the mean is 0.
// =============================================================================

use std::collections::VecDeque;

/// Incremental Bollinger width over the trailing close window.
#[derive(Debug, Clone)]
pub struct BollingerWidth {
    window: VecDeque<f64>,
    period: usize,
    num_std: f64,
}

impl BollingerWidth {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            window: VecDeque::with_capacity(period),
            period,
            num_std: 2.0,
        }
    }

    /// Feed one close and return the width computed over the window
    /// *including* this close.
    pub fn update(&mut self, close: f64) -> f64 {
        if self.window.len() == self.period {
            self.window.pop_front();
        }
        self.window.push_back(close);
        self.width()
    }

    /// Width over the current window.
    pub fn width(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        if mean == 0.0 {
            return 0.0;
        }
        let variance = self.window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        let upper = mean + self.num_std * std;
        let lower = mean - self.num_std * std;
        (upper - lower) / mean
    }
}
