// =============================================================================
// Point-in-Time Market Regime Detector
// =============================================================================
//
// Classifies each closed candle into a direction x volatility regime using
// only information available at or before that candle:
//
//   Direction — weighted vote of close vs EMA20/50/200, RSI momentum bands,
//               MACD histogram sign, and EMA20 slope. Bull if the score is
//               positive, bear if negative, neutral otherwise.
//   Volatility — expansion when ATR14/ATR50 > 1.1 OR the Bollinger width
//                exceeds the 70th percentile of *past* widths; contraction
//                otherwise.
//
// A new raw regime must persist for `persist_n` consecutive bars before it
// replaces the committed regime; after a commit the next `transition_bars`
// bars carry `is_transition = true`. The first `warmup` bars always emit
// `warming_up` with zero confidence while internal state keeps updating.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

use crate::indicators::atr::Atr;
use crate::indicators::bollinger::BollingerWidth;
use crate::indicators::ema::Ema;
use crate::indicators::macd::Macd;
use crate::indicators::rsi::Rsi;
use crate::market::Candle;
use crate::regime::htf::{HtfBias, HtfBiasTracker};

// =============================================================================
// Types
// =============================================================================

/// Market regime: direction combined with volatility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    WarmingUp,
    BullExpansion,
    BullContraction,
    BearExpansion,
    BearContraction,
    NeutralExpansion,
    NeutralContraction,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WarmingUp => "warming_up",
            Self::BullExpansion => "bull_expansion",
            Self::BullContraction => "bull_contraction",
            Self::BearExpansion => "bear_expansion",
            Self::BearContraction => "bear_contraction",
            Self::NeutralExpansion => "neutral_expansion",
            Self::NeutralContraction => "neutral_contraction",
        }
    }

    pub fn is_expansion(self) -> bool {
        matches!(
            self,
            Self::BullExpansion | Self::BearExpansion | Self::NeutralExpansion
        )
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrendVote {
    Bull,
    Bear,
    Neutral,
}

/// Raw per-bar indicator readings contributing to the classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeIndicators {
    pub rsi: f64,
    pub atr14: Option<f64>,
    pub atr50: Option<f64>,
    pub atr_ratio: f64,
    pub bb_width: f64,
    pub bb_threshold: f64,
    pub macd_hist: Option<f64>,
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub ema200: Option<f64>,
    pub dir_score: f64,
    pub total_weight: f64,
}

/// Classification result for one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub time: DateTime<Utc>,
    pub bar_index: usize,
    pub regime: Regime,
    /// min(1, |score| / total_weight); 0 during warmup.
    pub confidence: f64,
    pub is_transition: bool,
    pub htf_bias: Option<HtfBias>,
    pub indicators: RegimeIndicators,
}

/// Detector tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Bars emitted as `warming_up` before classification goes live.
    pub warmup: usize,
    /// Consecutive bars a new raw regime must persist before committing.
    pub persist_n: usize,
    /// Bars flagged `is_transition` after a commit.
    pub transition_bars: usize,
    /// Rolling Bollinger-width history length for the percentile threshold.
    pub bb_threshold_len: usize,
    /// Close window length for the Bollinger width itself.
    pub bb_period: usize,
    /// Optional higher-timeframe bucket length in seconds.
    pub htf_bucket_secs: Option<i64>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            warmup: 500,
            persist_n: 2,
            transition_bars: 3,
            bb_threshold_len: 200,
            bb_period: 20,
            htf_bucket_secs: None,
        }
    }
}

/// Fallback Bollinger-width threshold while the history holds <= 1 entry.
const BB_THRESHOLD_FALLBACK: f64 = 0.04;
/// ATR expansion cut-off.
const ATR_RATIO_EXPANSION: f64 = 1.1;

// =============================================================================
// Detector
// =============================================================================

/// Incremental, PIT-safe regime detector for one (symbol, timeframe).
#[derive(Debug, Clone)]
pub struct PitRegimeDetector {
    cfg: RegimeConfig,

    bars_seen: usize,
    prev_close: Option<f64>,

    ema20: Ema,
    ema50: Ema,
    ema200: Ema,
    rsi: Rsi,
    atr14: Atr,
    atr50: Atr,
    macd: Macd,
    bb: BollingerWidth,
    bbw_history: VecDeque<f64>,
    htf: Option<HtfBiasTracker>,

    current_regime: Option<Regime>,
    pending_regime: Option<Regime>,
    pending_count: usize,
    transition_left: usize,
}

impl PitRegimeDetector {
    pub fn new(cfg: RegimeConfig) -> Self {
        let htf = cfg.htf_bucket_secs.map(HtfBiasTracker::new);
        Self {
            bars_seen: 0,
            prev_close: None,
            ema20: Ema::new(20),
            ema50: Ema::new(50),
            ema200: Ema::new(200),
            rsi: Rsi::new(14),
            atr14: Atr::new(14),
            atr50: Atr::new(50),
            macd: Macd::standard(),
            bb: BollingerWidth::new(cfg.bb_period),
            bbw_history: VecDeque::with_capacity(cfg.bb_threshold_len),
            htf,
            current_regime: None,
            pending_regime: None,
            pending_count: 0,
            transition_left: 0,
            cfg,
        }
    }

    /// Process one closed candle and return the classification snapshot.
    pub fn process_bar(&mut self, bar: &Candle) -> RegimeSnapshot {
        let bar_index = self.bars_seen;
        self.bars_seen += 1;

        // ── Incremental indicator state ─────────────────────────────────
        let prev_close = self.prev_close;
        let atr14 = self.atr14.update(bar.high, bar.low, prev_close);
        let atr50 = self.atr50.update(bar.high, bar.low, prev_close);
        let rsi = self.rsi.update(bar.close);

        let prev_ema20 = self.ema20.value();
        let ema20 = self.ema20.update(bar.close);
        let ema50 = self.ema50.update(bar.close);
        let ema200 = self.ema200.update(bar.close);

        let macd_out = self.macd.update(bar.close);

        // Threshold comes from *past* widths only; the current width joins
        // the history afterwards.
        let bb_threshold = self.bb_width_threshold();
        let bb_width = self.bb.update(bar.close);
        if self.bbw_history.len() == self.cfg.bb_threshold_len {
            self.bbw_history.pop_front();
        }
        self.bbw_history.push_back(bb_width);

        // ── Direction score ─────────────────────────────────────────────
        let mut score = 0.0;
        let mut total_weight = 0.0;

        for (ema, weight) in [(ema20, 1.0), (ema50, 2.0), (ema200, 3.0)] {
            score += weight * sign(bar.close - ema);
            total_weight += weight;
        }

        // RSI momentum: +-2 beyond 55/45, extra +-1 beyond 70/30.
        if rsi > 55.0 {
            score += 2.0;
        } else if rsi < 45.0 {
            score -= 2.0;
        }
        if rsi > 70.0 {
            score += 1.0;
        } else if rsi < 30.0 {
            score -= 1.0;
        }
        total_weight += 3.0;

        if let Some(hist) = macd_out.hist {
            score += 2.0 * sign(hist);
            total_weight += 2.0;
        }

        if let Some(prev) = prev_ema20 {
            score += sign(ema20 - prev);
            total_weight += 1.0;
        }

        let mut trend = if score > 0.0 {
            TrendVote::Bull
        } else if score < 0.0 {
            TrendVote::Bear
        } else {
            TrendVote::Neutral
        };

        // ── Volatility split ────────────────────────────────────────────
        let atr_ratio = match (self.atr14.value(), self.atr50.value()) {
            (Some(a14), Some(a50)) if a50 != 0.0 => a14 / a50,
            _ => 1.0,
        };
        let expansion = atr_ratio > ATR_RATIO_EXPANSION || bb_width > bb_threshold;

        // ── Higher-timeframe veto ───────────────────────────────────────
        let htf_bias = self
            .htf
            .as_mut()
            .map(|h| h.update(bar.time, bar.close));
        if let Some(bias) = htf_bias {
            let contradicts = matches!(
                (bias, trend),
                (HtfBias::Bull, TrendVote::Bear) | (HtfBias::Bear, TrendVote::Bull)
            );
            if contradicts {
                trace!(bias = %bias, "HTF bias contradicts direction, forcing neutral");
                trend = TrendVote::Neutral;
            }
        }

        let raw = combine(trend, expansion);
        let confidence = if total_weight > 0.0 {
            (score.abs() / total_weight).min(1.0)
        } else {
            0.0
        };

        // ── Persistence & transition tracking ───────────────────────────
        let just_committed = self.apply_persistence(raw);
        let is_transition = if just_committed {
            self.transition_left = self.cfg.transition_bars;
            false
        } else if self.transition_left > 0 {
            self.transition_left -= 1;
            true
        } else {
            false
        };

        self.prev_close = Some(bar.close);

        let warming = bar_index < self.cfg.warmup;
        let indicators = RegimeIndicators {
            rsi,
            atr14: Some(atr14),
            atr50: Some(atr50),
            atr_ratio,
            bb_width,
            bb_threshold,
            macd_hist: macd_out.hist,
            ema20: Some(ema20),
            ema50: Some(ema50),
            ema200: Some(ema200),
            dir_score: score,
            total_weight,
        };

        if warming {
            RegimeSnapshot {
                time: bar.time,
                bar_index,
                regime: Regime::WarmingUp,
                confidence: 0.0,
                is_transition: false,
                htf_bias,
                indicators,
            }
        } else {
            RegimeSnapshot {
                time: bar.time,
                bar_index,
                regime: self.current_regime.unwrap_or(raw),
                confidence,
                is_transition,
                htf_bias,
                indicators,
            }
        }
    }

    /// The committed regime, once one exists.
    pub fn current_regime(&self) -> Option<Regime> {
        self.current_regime
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    /// Apply the persistence rule; returns true when the committed regime
    /// changed on this bar.
    fn apply_persistence(&mut self, raw: Regime) -> bool {
        match self.current_regime {
            None => {
                self.current_regime = Some(raw);
                false
            }
            Some(current) if raw == current => {
                self.pending_regime = None;
                self.pending_count = 0;
                false
            }
            Some(_) => {
                if self.pending_regime == Some(raw) {
                    self.pending_count += 1;
                } else {
                    self.pending_regime = Some(raw);
                    self.pending_count = 1;
                }
                if self.pending_count >= self.cfg.persist_n {
                    self.current_regime = Some(raw);
                    self.pending_regime = None;
                    self.pending_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// 70th percentile of the stored (past) Bollinger widths.
    fn bb_width_threshold(&self) -> f64 {
        if self.bbw_history.len() <= 1 {
            return BB_THRESHOLD_FALLBACK;
        }
        let mut sorted: Vec<f64> = self.bbw_history.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = 0.70 * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            let frac = rank - lo as f64;
            sorted[lo] * (1.0 - frac) + sorted[hi] * frac
        }
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn combine(trend: TrendVote, expansion: bool) -> Regime {
    match (trend, expansion) {
        (TrendVote::Bull, true) => Regime::BullExpansion,
        (TrendVote::Bull, false) => Regime::BullContraction,
        (TrendVote::Bear, true) => Regime::BearExpansion,
        (TrendVote::Bear, false) => Regime::BearContraction,
        (TrendVote::Neutral, true) => Regime::NeutralExpansion,
        (TrendVote::Neutral, false) => Regime::NeutralContraction,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        let time = Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap();
        Candle::new(time, open, high, low, close, 1_000.0)
    }

    /// Deterministic trend + cycle + hash-noise series.
    fn series(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let trend = 100.0 + i as f64 * 0.05;
                let cycle = 5.0 * (i as f64 * std::f64::consts::TAU / 50.0).sin();
                let noise = ((i * 2654435761) % 1000) as f64 / 1000.0 - 0.5;
                let close = trend + cycle + noise;
                let open = close - 0.2;
                bar(i, open, open.max(close) + 0.5, open.min(close) - 0.5, close)
            })
            .collect()
    }

    fn cfg(warmup: usize, persist_n: usize) -> RegimeConfig {
        RegimeConfig {
            warmup,
            persist_n,
            ..RegimeConfig::default()
        }
    }

    #[test]
    fn warmup_bars_emit_warming_up() {
        let mut det = PitRegimeDetector::new(cfg(50, 2));
        for (i, b) in series(100).iter().enumerate() {
            let snap = det.process_bar(b);
            assert_eq!(snap.bar_index, i);
            if i < 50 {
                assert_eq!(snap.regime, Regime::WarmingUp, "bar {i}");
                assert_eq!(snap.confidence, 0.0);
                assert!(!snap.is_transition);
            } else {
                assert_ne!(snap.regime, Regime::WarmingUp, "bar {i}");
            }
        }
    }

    #[test]
    fn persistence_requires_consecutive_confirmation() {
        // Strong uptrend commits bull; a single bear bar must not flip it.
        let mut det = PitRegimeDetector::new(cfg(10, 2));
        let mut price = 100.0;
        for i in 0..60 {
            price += 1.0;
            det.process_bar(&bar(i, price - 0.5, price + 1.0, price - 1.0, price));
        }
        let committed = det.current_regime().unwrap();
        assert!(matches!(
            committed,
            Regime::BullExpansion | Regime::BullContraction
        ));

        // One sharp down bar: raw regime flips but commit must not.
        price -= 30.0;
        let snap = det.process_bar(&bar(60, price + 0.5, price + 1.0, price - 1.0, price));
        assert_eq!(snap.regime, committed, "single contrary bar flipped regime");

        // Second consecutive contrary bar commits.
        price -= 30.0;
        let snap = det.process_bar(&bar(61, price + 0.5, price + 1.0, price - 1.0, price));
        assert_ne!(snap.regime, committed);
    }

    #[test]
    fn transition_flags_follow_commit() {
        let mut det = PitRegimeDetector::new(RegimeConfig {
            warmup: 10,
            persist_n: 2,
            transition_bars: 3,
            ..RegimeConfig::default()
        });
        let mut price = 100.0;
        for i in 0..60 {
            price += 1.0;
            det.process_bar(&bar(i, price - 0.5, price + 1.0, price - 1.0, price));
        }
        // Force a regime change with a persistent reversal.
        let mut flags = Vec::new();
        for i in 60..75 {
            price -= 25.0;
            let snap = det.process_bar(&bar(i, price + 0.5, price + 1.0, price - 1.0, price));
            flags.push(snap.is_transition);
        }
        // The longest run of transition flags never exceeds transition_bars.
        let mut max_run = 0;
        let mut run = 0;
        for f in &flags {
            if *f {
                run += 1;
                max_run = max_run.max(run);
            } else {
                run = 0;
            }
        }
        assert!(max_run > 0, "no transition was flagged");
        assert!(max_run <= 3, "transition run {max_run} exceeds transition_bars");
    }

    #[test]
    fn no_lookahead_prefix_property() {
        let bars = series(200);
        let mut full = PitRegimeDetector::new(cfg(20, 2));
        let full_snaps: Vec<RegimeSnapshot> = bars.iter().map(|b| full.process_bar(b)).collect();

        let mut prefix = PitRegimeDetector::new(cfg(20, 2));
        for (i, b) in bars.iter().take(100).enumerate() {
            let snap = prefix.process_bar(b);
            assert_eq!(snap, full_snaps[i], "lookahead detected at bar {i}");
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let bars = series(150);
        let run = |bars: &[Candle]| -> Vec<RegimeSnapshot> {
            let mut det = PitRegimeDetector::new(cfg(30, 2));
            bars.iter().map(|b| det.process_bar(b)).collect()
        };
        assert_eq!(run(&bars), run(&bars));
    }

    #[test]
    fn zero_volatility_is_contraction() {
        let mut det = PitRegimeDetector::new(cfg(10, 2));
        let mut last = None;
        for i in 0..30 {
            last = Some(det.process_bar(&bar(i, 100.0, 100.0, 100.0, 100.0)));
        }
        let snap = last.unwrap();
        assert!(!snap.regime.is_expansion(), "flat series classified {:?}", snap.regime);
    }

    #[test]
    fn atr_ratio_guard_defaults_to_one() {
        let mut det = PitRegimeDetector::new(cfg(5, 2));
        // All-equal bars give zero ATR on both horizons.
        let snap = det.process_bar(&bar(0, 100.0, 100.0, 100.0, 100.0));
        assert_eq!(snap.indicators.atr_ratio, 1.0);
    }

    #[test]
    fn bb_threshold_falls_back_with_short_history() {
        let mut det = PitRegimeDetector::new(cfg(5, 2));
        let snap = det.process_bar(&bar(0, 100.0, 101.0, 99.0, 100.0));
        assert_eq!(snap.indicators.bb_threshold, BB_THRESHOLD_FALLBACK);
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let mut det = PitRegimeDetector::new(cfg(20, 2));
        for b in series(300) {
            let snap = det.process_bar(&b);
            assert!((0.0..=1.0).contains(&snap.confidence));
        }
    }

    #[test]
    fn macd_hist_absent_on_first_bar() {
        let mut det = PitRegimeDetector::new(cfg(5, 2));
        let snap = det.process_bar(&bar(0, 100.0, 101.0, 99.0, 100.0));
        assert!(snap.indicators.macd_hist.is_none());
        let snap = det.process_bar(&bar(1, 100.0, 101.0, 99.0, 100.5));
        assert!(snap.indicators.macd_hist.is_some());
    }

    #[test]
    fn htf_veto_neutralises_contrary_direction() {
        // Long bull history commits the HTF bull bias; a fresh short-term
        // bear streak must then classify neutral, not bear.
        let mut with_htf = PitRegimeDetector::new(RegimeConfig {
            warmup: 10,
            persist_n: 1,
            // 60 one-minute bars per bucket: the HTF state is dominated by the
            // long bull history and the brief bear streak cannot overturn it.
            htf_bucket_secs: Some(3600),
            ..RegimeConfig::default()
        });
        let mut without = PitRegimeDetector::new(RegimeConfig {
            warmup: 10,
            persist_n: 1,
            ..RegimeConfig::default()
        });

        let mut price = 100.0;
        let mut last_with = None;
        let mut last_without = None;
        for i in 0..400 {
            price += 0.5;
            let b = bar(i, price - 0.2, price + 0.5, price - 0.5, price);
            with_htf.process_bar(&b);
            without.process_bar(&b);
        }
        for i in 400..412 {
            price -= 2.0;
            let b = bar(i, price + 0.2, price + 0.5, price - 0.5, price);
            last_with = Some(with_htf.process_bar(&b));
            last_without = Some(without.process_bar(&b));
        }

        let with_snap = last_with.unwrap();
        let without_snap = last_without.unwrap();
        assert_eq!(with_snap.htf_bias, Some(HtfBias::Bull));
        assert!(matches!(
            without_snap.regime,
            Regime::BearExpansion | Regime::BearContraction
        ));
        assert!(matches!(
            with_snap.regime,
            Regime::NeutralExpansion | Regime::NeutralContraction
        ));
    }

    #[test]
    fn regime_display_labels() {
        assert_eq!(Regime::BullExpansion.to_string(), "bull_expansion");
        assert_eq!(Regime::WarmingUp.to_string(), "warming_up");
        assert_eq!(Regime::NeutralContraction.to_string(), "neutral_contraction");
    }
}
