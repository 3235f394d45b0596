// =============================================================================
// Enriched rows — candle + indicators + regime, kept in a bounded ring
// =============================================================================
//
// One `EnrichedRow` is produced per closed candle: the candle itself, every
// configured indicator value (absent key == unavailable value), the regime
// classification, and `previous` copies of the prior stored row's close and
// indicator values. Rows are shared as `Arc` so event payloads and history
// stay cheap to clone.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::market::Candle;
use crate::regime::Regime;

/// Shared snapshot of recent rows per timeframe, as carried by
/// `IndicatorsCalculated` events and consumed by the strategy layer.
pub type RecentRows = Arc<HashMap<String, Vec<Arc<EnrichedRow>>>>;

/// Default number of recent rows retained per timeframe.
pub const DEFAULT_RECENT_ROWS: usize = 6;

/// Key used for the prior close inside `previous`.
pub const PREV_CLOSE_KEY: &str = "close";

/// A candle enriched with indicator values and regime classification.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRow {
    pub candle: Candle,
    /// Indicator values by name ("ema_20", "rsi", "macd_hist", ...). A
    /// missing key means the indicator was not yet available — never 0.
    pub indicators: BTreeMap<String, f64>,
    pub regime: Regime,
    pub regime_confidence: f64,
    pub is_transition: bool,
    /// Prior stored row's close + indicator values (empty on the first row).
    pub previous: BTreeMap<String, f64>,
}

impl EnrichedRow {
    pub fn indicator(&self, name: &str) -> Option<f64> {
        self.indicators.get(name).copied()
    }

    pub fn previous_value(&self, name: &str) -> Option<f64> {
        self.previous.get(name).copied()
    }
}

/// Bounded ring of the most recent enriched rows for one timeframe.
#[derive(Debug, Clone)]
pub struct RowBuffer {
    rows: VecDeque<Arc<EnrichedRow>>,
    capacity: usize,
}

impl RowBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rows: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Build the enriched row (attaching `previous` from the last stored row),
    /// store it, and return it.
    pub fn push(
        &mut self,
        candle: Candle,
        indicators: BTreeMap<String, f64>,
        regime: Regime,
        regime_confidence: f64,
        is_transition: bool,
    ) -> Arc<EnrichedRow> {
        let previous = match self.rows.back() {
            None => BTreeMap::new(),
            Some(last) => {
                let mut prev = last.indicators.clone();
                prev.insert(PREV_CLOSE_KEY.to_string(), last.candle.close);
                prev
            }
        };

        let row = Arc::new(EnrichedRow {
            candle,
            indicators,
            regime,
            regime_confidence,
            is_transition,
            previous,
        });

        if self.rows.len() == self.capacity {
            self.rows.pop_front();
        }
        self.rows.push_back(Arc::clone(&row));
        row
    }

    pub fn latest(&self) -> Option<Arc<EnrichedRow>> {
        self.rows.back().cloned()
    }

    /// Snapshot of the stored rows, oldest first.
    pub fn rows(&self) -> Vec<Arc<EnrichedRow>> {
        self.rows.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}
