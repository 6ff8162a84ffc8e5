// =============================================================================
// Mock Feed: fixed trades at a fixed pace, for local runs without network
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::TradeFeed;
use crate::types::Trade;

pub struct MockFeed {
    trades: Vec<Trade>,
    delay: Duration,
}

impl MockFeed {
    pub fn new(trades: Vec<Trade>, delay: Duration) -> Self {
        Self { trades, delay }
    }

    /// Two canned trades per pair, stamped with the current wall clock and
    /// fixed event times.
    pub fn for_pairs(pairs: &[String], delay: Duration) -> Result<Self> {
        let now = Utc::now();
        let mut trades = Vec::with_capacity(pairs.len() * 2);
        for pair in pairs {
            trades.push(Trade::new(pair.as_str(), 10000.0, 0.1, now, 1_234_567_890)?);
            trades.push(Trade::new(pair.as_str(), 10001.0, 0.2, now, 1_234_567_891)?);
        }
        Ok(Self::new(trades, delay))
    }
}

#[async_trait]
impl TradeFeed for MockFeed {
    async fn next_batch(&mut self) -> Result<Vec<Trade>> {
        tokio::time::sleep(self.delay).await;
        debug!(count = self.trades.len(), "mock batch");
        Ok(self.trades.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
