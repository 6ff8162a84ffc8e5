// =============================================================================
// Trade Relay: feed batches onto the trade topic, one message per trade
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app_state::PipelineStats;
use crate::bus::{publish_json, Producer};
use crate::feed::TradeFeed;
use crate::retry::ExponentialBackoff;
use crate::types::Trade;

pub struct TradeRelay {
    producer: Arc<dyn Producer>,
    topic: String,
    backoff: ExponentialBackoff,
    stats: Arc<PipelineStats>,
}

impl TradeRelay {
    pub fn new(
        producer: Arc<dyn Producer>,
        topic: impl Into<String>,
        backoff: ExponentialBackoff,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            backoff,
            stats,
        }
    }

    /// Publish a single trade keyed by its pair.
    pub async fn publish(&self, trade: &Trade) -> Result<()> {
        let retries = publish_json(
            self.producer.as_ref(),
            &self.topic,
            trade.pair(),
            trade,
            self.backoff.clone(),
        )
        .await
        .with_context(|| format!("failed to publish trade for {}", trade.pair()))?;
        PipelineStats::add(&self.stats.publish_retries, u64::from(retries));
        PipelineStats::bump(&self.stats.trades_published);
        debug!(pair = %trade.pair(), price = trade.price(), at = %trade.timestamp(), "trade published");
        Ok(())
    }

    /// Pull batches from `feed` and publish every trade, in feed order.
    ///
    /// Returns `Ok` when `shutdown` flips; any feed or publish error that
    /// survived its retries ends the loop with that error. A batch already
    /// being published is finished before shutdown is honoured.
    pub async fn run(&self, feed: &mut dyn TradeFeed, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(feed = feed.name(), topic = %self.topic, "trade relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = feed.next_batch() => batch.context("trade feed failed")?,
            };

            if batch.is_empty() {
                debug!("no trades in batch");
                PipelineStats::bump(&self.stats.empty_batches);
                continue;
            }

            for trade in &batch {
                self.publish(trade).await?;
            }
            info!(count = batch.len(), topic = %self.topic, "pushed trades");
        }

        warn!("trade relay stopped");
        Ok(())
    }
}
