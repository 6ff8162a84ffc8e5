// =============================================================================
// Trade Feeds: one capability, two sources
// =============================================================================
//
// The ingestion service only sees `dyn TradeFeed`. Which implementation sits
// behind it (the live websocket or the deterministic mock) is decided by the
// caller when it builds the feed.
// =============================================================================

pub mod kraken;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::app_state::PipelineStats;
use crate::runtime_config::{FeedMode, PipelineConfig};
use crate::types::Trade;

pub use kraken::KrakenFeed;
pub use mock::MockFeed;

/// A connected source of trades.
///
/// Construction performs the connection and subscription handshake; after
/// that the feed yields an unbounded sequence of batches and cannot be
/// restarted from the beginning.
#[async_trait]
pub trait TradeFeed: Send {
    /// Wait for the next upstream frame and return the trades it carried.
    /// Control frames and unusable frames yield an empty batch.
    async fn next_batch(&mut self) -> Result<Vec<Trade>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Build the feed selected in `config`.
pub async fn connect(config: &PipelineConfig, stats: Arc<PipelineStats>) -> Result<Box<dyn TradeFeed>> {
    info!(mode = %config.feed, pairs = ?config.pairs, "connecting trade feed");
    match config.feed {
        FeedMode::Live => {
            let feed = KrakenFeed::connect(
                &config.feed_url,
                &config.pairs,
                config.retry.backoff(),
                stats,
            )
            .await?;
            Ok(Box::new(feed))
        }
        FeedMode::Mock => {
            let feed = MockFeed::for_pairs(&config.pairs, Duration::from_millis(config.mock_delay_ms))?;
            Ok(Box::new(feed))
        }
    }
}
