// =============================================================================
// True Range & Average True Range (ATR) — Wilder smoothing, incremental
// =============================================================================
//
// True Range for a bar:
//   no previous close => high - low
//   otherwise         => max(high - low, |high - prev_close|, |low - prev_close|)
//
// ATR applies Wilder's smoothing over TR:
//   first TR initialises; then atr <- atr + (tr - atr) / period
// =============================================================================

/// Compute the true range for one bar.
pub fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    match prev_close {
        None => high - low,
        Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
    }
}

/// Generic Wilder smoother: first value initialises, then
/// `y <- prev + (x - prev) / period`.
#[derive(Debug, Clone)]
pub struct Wilder {
    period: f64,
    value: Option<f64>,
}

impl Wilder {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1) as f64,
            value: None,
        }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(prev) => prev + (x - prev) / self.period,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Incremental ATR over true ranges.
#[derive(Debug, Clone)]
pub struct Atr {
    smoother: Wilder,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            smoother: Wilder::new(period),
        }
    }

    /// Feed one bar. The caller supplies the previous close (None on the
    /// first bar of the series).
    pub fn update(&mut self, high: f64, low: f64, prev_close: Option<f64>) -> f64 {
        self.smoother.update(true_range(high, low, prev_close))
    }

    pub fn value(&self) -> Option<f64> {
        self.smoother.value()
    }
}
