// =============================================================================
// Higher-Timeframe Bias — PIT-safe aggregation of closes into HTF buckets
// =============================================================================
//
// Closes are grouped into fixed-size time buckets (e.g. 4 h). The HTF
// EMA12/26/200 and MACD signal are only fed when a bucket *flips*, and they
// are fed the previous bucket's last close — the in-progress bucket never
// leaks into the bias. This keeps the computation point-in-time: replaying a
// prefix of the stream yields the same bias sequence.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indicators::ema::Ema;

/// Directional bias derived from the higher timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HtfBias {
    Bull,
    Bear,
    Neutral,
}

impl std::fmt::Display for HtfBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "bull"),
            Self::Bear => write!(f, "bear"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Incremental HTF bias tracker.
#[derive(Debug, Clone)]
pub struct HtfBiasTracker {
    bucket_secs: i64,
    current_bucket: Option<i64>,
    bucket_last_close: f64,
    ema12: Ema,
    ema26: Ema,
    ema200: Ema,
    signal: Ema,
    bias: HtfBias,
}

impl HtfBiasTracker {
    /// `bucket_secs` is the higher-timeframe length in seconds (e.g. 14400
    /// for 4 h).
    pub fn new(bucket_secs: i64) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1),
            current_bucket: None,
            bucket_last_close: 0.0,
            ema12: Ema::new(12),
            ema26: Ema::new(26),
            ema200: Ema::new(200),
            signal: Ema::new(9),
            bias: HtfBias::Neutral,
        }
    }

    /// Feed one lower-timeframe close and return the current bias.
    pub fn update(&mut self, time: DateTime<Utc>, close: f64) -> HtfBias {
        let bucket = time.timestamp().div_euclid(self.bucket_secs);

        match self.current_bucket {
            None => {
                self.current_bucket = Some(bucket);
                self.bucket_last_close = close;
            }
            Some(cur) if bucket == cur => {
                self.bucket_last_close = close;
            }
            Some(_) => {
                // Bucket flipped: commit the completed bucket's close.
                let committed = self.bucket_last_close;
                let line = self.ema12.update(committed) - self.ema26.update(committed);
                let ema200 = self.ema200.update(committed);
                let signal_ready = self.signal.value().is_some();
                let signal = self.signal.update(line);
                let hist = if signal_ready { Some(line - signal) } else { None };

                self.bias = Self::classify(committed, ema200, hist);
                self.current_bucket = Some(bucket);
                self.bucket_last_close = close;
            }
        }

        self.bias
    }

    pub fn bias(&self) -> HtfBias {
        self.bias
    }

    fn classify(close: f64, ema200: f64, hist: Option<f64>) -> HtfBias {
        let mut score = 0i32;
        if close > ema200 {
            score += 1;
        } else if close < ema200 {
            score -= 1;
        }
        match hist {
            Some(h) if h > 0.0 => score += 1,
            Some(h) if h < 0.0 => score -= 1,
            _ => {}
        }
        if score > 0 {
            HtfBias::Bull
        } else if score < 0 {
            HtfBias::Bear
        } else {
            HtfBias::Neutral
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn neutral_until_first_bucket_completes() {
        let mut htf = HtfBiasTracker::new(3600);
        assert_eq!(htf.update(t(0), 100.0), HtfBias::Neutral);
        assert_eq!(htf.update(t(1800), 105.0), HtfBias::Neutral);
    }

    #[test]
    fn in_progress_bucket_does_not_leak() {
        // Identical committed buckets, wildly different forming closes.
        let mut a = HtfBiasTracker::new(3600);
        let mut b = HtfBiasTracker::new(3600);
        for i in 0..10 {
            let close = 100.0 + i as f64;
            a.update(t(i * 3600), close);
            b.update(t(i * 3600), close);
        }
        // Feed different closes inside the same (unfinished) bucket.
        let ba = a.update(t(10 * 3600 + 60), 500.0);
        let bb = b.update(t(10 * 3600 + 60), 1.0);
        assert_eq!(ba, bb);
    }

    #[test]
    fn sustained_uptrend_turns_bull() {
        let mut htf = HtfBiasTracker::new(3600);
        let mut bias = HtfBias::Neutral;
        for i in 0..300 {
            bias = htf.update(t(i * 3600), 100.0 + i as f64);
        }
        assert_eq!(bias, HtfBias::Bull);
    }

    #[test]
    fn sustained_downtrend_turns_bear() {
        let mut htf = HtfBiasTracker::new(3600);
        let mut bias = HtfBias::Neutral;
        for i in 0..300 {
            bias = htf.update(t(i * 3600), 1000.0 - i as f64);
        }
        assert_eq!(bias, HtfBias::Bear);
    }

    #[test]
    fn replay_prefix_is_identical() {
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.3).sin() * 10.0).collect();
        let mut full = HtfBiasTracker::new(3600);
        let mut biases_full = Vec::new();
        for (i, &c) in closes.iter().enumerate() {
            biases_full.push(full.update(t(i as i64 * 3600), c));
        }
        let mut prefix = HtfBiasTracker::new(3600);
        for (i, &c) in closes.iter().take(100).enumerate() {
            let b = prefix.update(t(i as i64 * 3600), c);
            assert_eq!(b, biases_full[i], "HTF bias diverged at bar {i}");
        }
    }
}
