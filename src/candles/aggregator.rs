// =============================================================================
// Candle Aggregator: folds the trade stream into tumbling-window candles
// =============================================================================
//
// Every accepted trade yields a fresh snapshot of its window; there is no
// separate "window closed" event. Downstream consumers see a window as
// finished when a candle with a later `window_start_ms` arrives for the same
// pair.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use super::window_store::{CandleAccumulator, LateTrade, WindowStore};
use crate::app_state::PipelineStats;
use crate::types::{Candle, Trade};

/// What happened to one trade.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    /// The trade was folded in; this is the window's new state.
    Updated(Candle),
    /// The trade's window had already been closed for its pair.
    DroppedLate(LateTrade),
}

pub struct CandleAggregator {
    store: WindowStore,
    stats: Arc<PipelineStats>,
}

impl CandleAggregator {
    pub fn new(store: WindowStore, stats: Arc<PipelineStats>) -> Self {
        Self { store, stats }
    }

    pub fn on_trade(&mut self, trade: &Trade) -> AggregateOutcome {
        let candle = match self.store.upsert(trade) {
            Ok(acc) => acc.to_candle(),
            Err(late) => {
                warn!(
                    window = %late.key,
                    window_end_ms = late.window_end_ms,
                    watermark_ms = late.watermark_ms,
                    trade_ts_ms = trade.timestamp_ms(),
                    "dropping trade for closed window"
                );
                PipelineStats::bump(&self.stats.late_trades_dropped);
                return AggregateOutcome::DroppedLate(late);
            }
        };
        PipelineStats::bump(&self.stats.trades_aggregated);

        for closed in self.store.evict_closed(trade.pair()) {
            log_closed(&closed);
            PipelineStats::bump(&self.stats.windows_evicted);
        }
        self.stats
            .open_windows
            .store(self.store.len() as u64, Ordering::Relaxed);

        debug!(
            pair = %candle.pair,
            window_start_ms = candle.window_start_ms,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            watermark_ms = ?self.store.watermark(trade.pair()),
            "candle"
        );
        AggregateOutcome::Updated(candle)
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }
}

fn log_closed(acc: &CandleAccumulator) {
    debug!(
        window = %acc.key(),
        close = acc.close,
        volume = acc.volume,
        "window closed and evicted"
    );
}
