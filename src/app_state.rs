// =============================================================================
// Pipeline Statistics: counters shared by both services
// =============================================================================
//
// Each service holds an `Arc<PipelineStats>` and bumps lock-free counters as
// it works. The status endpoint and the shutdown summary read a serialisable
// snapshot.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug)]
pub struct PipelineStats {
    // ── Feed ────────────────────────────────────────────────────────────
    pub frames_received: AtomicU64,
    pub heartbeats: AtomicU64,
    /// Frames that were not JSON or carried no trade list.
    pub malformed_frames: AtomicU64,
    /// Individual trade entries rejected inside an otherwise valid frame.
    pub rejected_entries: AtomicU64,
    pub feed_reconnects: AtomicU64,
    pub empty_batches: AtomicU64,

    // ── Trade relay ─────────────────────────────────────────────────────
    pub trades_published: AtomicU64,

    // ── Aggregation ─────────────────────────────────────────────────────
    pub trades_consumed: AtomicU64,
    pub undecodable_messages: AtomicU64,
    pub trades_aggregated: AtomicU64,
    pub late_trades_dropped: AtomicU64,
    pub windows_evicted: AtomicU64,
    /// Gauge: accumulators currently held by the window store.
    pub open_windows: AtomicU64,

    // ── Candle relay ────────────────────────────────────────────────────
    pub candles_published: AtomicU64,

    /// Publish attempts that had to be repeated, over both relays.
    pub publish_retries: AtomicU64,

    pub start_time: Instant,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub frames_received: u64,
    pub heartbeats: u64,
    pub malformed_frames: u64,
    pub rejected_entries: u64,
    pub feed_reconnects: u64,
    pub empty_batches: u64,
    pub trades_published: u64,
    pub trades_consumed: u64,
    pub undecodable_messages: u64,
    pub trades_aggregated: u64,
    pub late_trades_dropped: u64,
    pub windows_evicted: u64,
    pub open_windows: u64,
    pub candles_published: u64,
    pub publish_retries: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            rejected_entries: AtomicU64::new(0),
            feed_reconnects: AtomicU64::new(0),
            empty_batches: AtomicU64::new(0),
            trades_published: AtomicU64::new(0),
            trades_consumed: AtomicU64::new(0),
            undecodable_messages: AtomicU64::new(0),
            trades_aggregated: AtomicU64::new(0),
            late_trades_dropped: AtomicU64::new(0),
            windows_evicted: AtomicU64::new(0),
            open_windows: AtomicU64::new(0),
            candles_published: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Increment `counter` by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            frames_received: get(&self.frames_received),
            heartbeats: get(&self.heartbeats),
            malformed_frames: get(&self.malformed_frames),
            rejected_entries: get(&self.rejected_entries),
            feed_reconnects: get(&self.feed_reconnects),
            empty_batches: get(&self.empty_batches),
            trades_published: get(&self.trades_published),
            trades_consumed: get(&self.trades_consumed),
            undecodable_messages: get(&self.undecodable_messages),
            trades_aggregated: get(&self.trades_aggregated),
            late_trades_dropped: get(&self.late_trades_dropped),
            windows_evicted: get(&self.windows_evicted),
            open_windows: get(&self.open_windows),
            candles_published: get(&self.candles_published),
            publish_retries: get(&self.publish_retries),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}
