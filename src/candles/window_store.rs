// =============================================================================
// Window Store: in-progress candles keyed by (pair, window start)
// =============================================================================
//
// Windows are tumbling: `start = floor(ts / D) * D`, `end = start + D`.
//
// Each pair carries its own watermark, the largest event time seen for it.
// A window is closed once `end + grace <= watermark`; closed windows are
// evicted and a trade that maps into a closed window is refused.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::types::{Candle, Trade};

/// Start of the tumbling window of length `window_ms` containing `ts_ms`.
/// Uses floor division, so negative timestamps map to the window below.
pub fn window_start(ts_ms: i64, window_ms: i64) -> i64 {
    ts_ms.div_euclid(window_ms) * window_ms
}

/// Composite key that identifies one window of one pair.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct WindowKey {
    pub pair: String,
    pub window_start_ms: i64,
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pair, self.window_start_ms)
    }
}

/// Running OHLCV state of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleAccumulator {
    pub pair: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub last_trade_ts_ms: i64,
}

impl CandleAccumulator {
    fn seed(trade: &Trade, window_start_ms: i64, window_end_ms: i64) -> Self {
        let price = trade.price();
        Self {
            pair: trade.pair().to_string(),
            window_start_ms,
            window_end_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: trade.volume(),
            last_trade_ts_ms: trade.timestamp_ms(),
        }
    }

    fn fold(&mut self, trade: &Trade) {
        let price = trade.price();
        self.close = price;
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.volume += trade.volume();
        self.last_trade_ts_ms = trade.timestamp_ms();
    }

    pub fn key(&self) -> WindowKey {
        WindowKey {
            pair: self.pair.clone(),
            window_start_ms: self.window_start_ms,
        }
    }

    /// Flat snapshot of the current state, stamped with the event time of
    /// the trade that produced it.
    pub fn to_candle(&self) -> Candle {
        Candle {
            pair: self.pair.clone(),
            timestamp_ms: self.last_trade_ts_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
        }
    }
}

/// A trade refused because its window is already closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateTrade {
    pub key: WindowKey,
    pub window_end_ms: i64,
    pub watermark_ms: i64,
}

#[derive(Debug, Default)]
struct PairWindows {
    watermark_ms: Option<i64>,
    /// Open windows ordered by start.
    windows: BTreeMap<i64, CandleAccumulator>,
}

/// All open windows, grouped per pair so that one pair's windows and
/// watermark are never touched by another pair's trades.
#[derive(Debug)]
pub struct WindowStore {
    window_ms: i64,
    grace_ms: i64,
    pairs: HashMap<String, PairWindows>,
}

impl WindowStore {
    /// `window_ms` must be positive; a negative grace is treated as zero.
    pub fn new(window_ms: i64, grace_ms: i64) -> Self {
        assert!(window_ms > 0, "window length must be positive");
        Self {
            window_ms,
            grace_ms: grace_ms.max(0),
            pairs: HashMap::new(),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn grace_ms(&self) -> i64 {
        self.grace_ms
    }

    /// Fold `trade` into its window, creating the window on first use.
    ///
    /// Returns the updated accumulator, or [`LateTrade`] without touching any
    /// state when the window was already closed for this pair.
    pub fn upsert(&mut self, trade: &Trade) -> Result<&CandleAccumulator, LateTrade> {
        let start = window_start(trade.timestamp_ms(), self.window_ms);
        let end = start.saturating_add(self.window_ms);
        let grace = self.grace_ms;

        let entry = self.pairs.entry(trade.pair().to_string()).or_default();
        if let Some(wm) = entry.watermark_ms {
            if end.saturating_add(grace) <= wm {
                return Err(LateTrade {
                    key: WindowKey {
                        pair: trade.pair().to_string(),
                        window_start_ms: start,
                    },
                    window_end_ms: end,
                    watermark_ms: wm,
                });
            }
        }
        entry.watermark_ms = Some(
            entry
                .watermark_ms
                .map_or(trade.timestamp_ms(), |wm| wm.max(trade.timestamp_ms())),
        );

        let acc = entry
            .windows
            .entry(start)
            .and_modify(|acc| acc.fold(trade))
            .or_insert_with(|| {
                debug!(pair = %trade.pair(), window_start_ms = start, "window opened");
                CandleAccumulator::seed(trade, start, end)
            });
        Ok(acc)
    }

    /// Remove and return every window of `pair` that the pair's watermark
    /// has closed, oldest first.
    pub fn evict_closed(&mut self, pair: &str) -> Vec<CandleAccumulator> {
        let grace = self.grace_ms;
        let Some(entry) = self.pairs.get_mut(pair) else {
            return Vec::new();
        };
        let Some(wm) = entry.watermark_ms else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while let Some(first) = entry.windows.first_entry() {
            if first.get().window_end_ms.saturating_add(grace) > wm {
                break;
            }
            evicted.push(first.remove());
        }
        evicted
    }

    /// Latest event time seen for `pair`.
    pub fn watermark(&self, pair: &str) -> Option<i64> {
        self.pairs.get(pair).and_then(|p| p.watermark_ms)
    }

    /// Number of open windows over all pairs.
    pub fn len(&self) -> usize {
        self.pairs.values().map(|p| p.windows.len()).sum()
    }

    /// Open windows of `pair`, oldest first.
    pub fn open_windows(&self, pair: &str) -> Vec<&CandleAccumulator> {
        self.pairs
            .get(pair)
            .map(|p| p.windows.values().collect())
            .unwrap_or_default()
    }
}
