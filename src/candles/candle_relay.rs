// =============================================================================
// Candle Relay + aggregation service loop
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::aggregator::{AggregateOutcome, CandleAggregator};
use crate::app_state::PipelineStats;
use crate::bus::{publish_json, BusMessage, Consumer, Producer};
use crate::retry::ExponentialBackoff;
use crate::types::{Candle, Trade};

/// Publishes every candle snapshot to the candle topic, keyed by pair.
pub struct CandleRelay {
    producer: Arc<dyn Producer>,
    topic: String,
    backoff: ExponentialBackoff,
    stats: Arc<PipelineStats>,
}

impl CandleRelay {
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

    pub async fn publish(&self, candle: &Candle) -> Result<()> {
        let retries = publish_json(
            self.producer.as_ref(),
            &self.topic,
            &candle.pair,
            candle,
            self.backoff.clone(),
        )
        .await
        .with_context(|| format!("failed to publish candle for {}", candle.pair))?;
        PipelineStats::add(&self.stats.publish_retries, u64::from(retries));
        PipelineStats::bump(&self.stats.candles_published);
        Ok(())
    }
}

fn decode_trade(msg: &BusMessage) -> Result<Trade> {
    serde_json::from_slice(&msg.payload).with_context(|| {
        format!(
            "undecodable trade at {}/{}@{}",
            msg.topic, msg.partition, msg.offset
        )
    })
}

/// Consume trades, aggregate them and publish a candle per accepted trade.
///
/// Runs until `shutdown` flips, the bus is closed, or a publish fails for
/// good. Offsets are committed after the candle for a message has been
/// published, so a restart re-delivers at most the in-flight message.
pub async fn run_candle_service<C: Consumer>(
    consumer: &mut C,
    aggregator: &mut CandleAggregator,
    relay: &CandleRelay,
    stats: &PipelineStats,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        window_ms = aggregator.store().window_ms(),
        grace_ms = aggregator.store().grace_ms(),
        "candle service started"
    );

    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }

        let msg = tokio::select! {
            _ = shutdown.changed() => {
                info!("candle service shutting down");
                break Ok(());
            }
            polled = consumer.poll() => match polled {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("trade topic closed");
                    break Ok(());
                }
                Err(e) => break Err(anyhow::Error::from(e).context("trade consumer failed")),
            },
        };
        PipelineStats::bump(&stats.trades_consumed);

        let trade = match decode_trade(&msg) {
            Ok(trade) => trade,
            Err(e) => {
                warn!(error = %format!("{e:#}"), key = %msg.key, "skipping message");
                PipelineStats::bump(&stats.undecodable_messages);
                consumer.commit()?;
                continue;
            }
        };
        debug!(pair = %trade.pair(), ts = trade.timestamp_ms(), "trade consumed");

        if let AggregateOutcome::Updated(candle) = aggregator.on_trade(&trade) {
            if let Err(e) = relay.publish(&candle).await {
                break Err(e);
            }
        }
        consumer.commit()?;
    };

    // A failed publish leaves the in-flight message uncommitted so the group
    // reads it again after a restart.
    if result.is_ok() {
        if let Err(e) = consumer.commit() {
            warn!(error = %e, "final offset commit failed");
        }
    }
    info!(
        open_windows = aggregator.store().len(),
        "candle service stopped"
    );
    result
}
