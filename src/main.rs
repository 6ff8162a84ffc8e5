// =============================================================================
// Candle Stream: Main Entry Point
// =============================================================================
//
// Two services share this binary:
//   trades    trade feed → trade topic
//   candles   trade topic → tumbling-window candles → candle topic
//
// `candle-stream [trades|candles|all]` picks which of them run (default
// `all`). Both are joined by one in-process bus and stop together on
// Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bus;
mod candles;
mod feed;
mod retry;
mod runtime_config;
mod trade_relay;
mod types;

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::PipelineStats;
use crate::bus::{MemoryBus, MemoryConsumer, MemoryProducer};
use crate::candles::{run_candle_service, CandleAggregator, CandleRelay, WindowStore};
use crate::retry::retry_async;
use crate::runtime_config::PipelineConfig;
use crate::trade_relay::TradeRelay;

const DEFAULT_CONFIG_PATH: &str = "pipeline_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    Trades,
    Candles,
    All,
}

impl Service {
    fn parse(arg: Option<&str>) -> Result<Self> {
        match arg.map(str::to_ascii_lowercase).as_deref() {
            None | Some("all") => Ok(Self::All),
            Some("trades") => Ok(Self::Trades),
            Some("candles") => Ok(Self::Candles),
            Some(other) => bail!("unknown service {other:?} (expected trades, candles or all)"),
        }
    }

    fn runs_trades(self) -> bool {
        matches!(self, Self::Trades | Self::All)
    }

    fn runs_candles(self) -> bool {
        matches!(self, Self::Candles | Self::All)
    }

    /// Single-service modes share the bus with nobody: the other side runs
    /// in a different process with its own in-process bus.
    fn isolation_warning(self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Trades => Some("trades are published to an in-process bus that no candle service reads"),
            Self::Candles => Some("no trade service publishes to this in-process bus; the candle service will wait idle"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let service = Service::parse(std::env::args().nth(1).as_deref())?;

    let config_path =
        std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env()?;
    config.validate()?;

    info!(
        service = ?service,
        broker = %config.broker_address,
        trade_topic = %config.trade_topic,
        candle_topic = %config.candle_topic,
        consumer_group = %config.consumer_group,
        candle_seconds = config.candle_seconds,
        grace_seconds = config.grace_seconds,
        pairs = ?config.pairs,
        feed = %config.feed,
        "Candle stream starting"
    );

    if let Some(warning) = service.isolation_warning() {
        warn!(service = ?service, "{warning}; run `all` for a working pipeline");
    }

    // ── 2. Shared state ──────────────────────────────────────────────────
    let stats = Arc::new(PipelineStats::new());
    let bus = MemoryBus::new(config.partitions, config.retention_per_partition);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut services = JoinSet::new();

    // ── 3. Status API ────────────────────────────────────────────────────
    {
        let addr = config.status_addr.clone();
        let stats = stats.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = api::rest::serve(&addr, stats, shutdown).await {
                error!(error = %format!("{e:#}"), "status API stopped");
            }
        });
    }

    // ── 4. Services ──────────────────────────────────────────────────────
    if service.runs_trades() {
        let (config, bus, stats, shutdown) =
            (config.clone(), bus.clone(), stats.clone(), shutdown_rx.clone());
        services.spawn(async move {
            ("trades", run_trade_service(config, bus, stats, shutdown).await)
        });
    }
    if service.runs_candles() {
        let (config, bus, stats, shutdown) =
            (config.clone(), bus.clone(), stats.clone(), shutdown_rx.clone());
        services.spawn(async move {
            ("candles", run_aggregation_service(config, bus, stats, shutdown).await)
        });
    }

    info!("All services running. Press Ctrl+C to stop.");

    // ── 5. Wait for Ctrl+C or the first service to stop ──────────────────
    let mut failed = false;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            warn!("Shutdown signal received, stopping gracefully");
        }
        Some(joined) = services.join_next() => {
            failed |= report(joined);
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = services.join_next().await {
        failed |= report(joined);
    }
    bus.close();
    if service.runs_trades() && !service.runs_candles() {
        info!(
            topic = %config.trade_topic,
            retained = bus.retained(&config.trade_topic),
            "trades left on the in-process bus"
        );
    }

    let snapshot = stats.snapshot();
    info!(
        trades_published = snapshot.trades_published,
        trades_aggregated = snapshot.trades_aggregated,
        late_trades_dropped = snapshot.late_trades_dropped,
        candles_published = snapshot.candles_published,
        "Candle stream shut down complete."
    );

    if failed {
        bail!("a service stopped with an error");
    }
    Ok(())
}

/// Log how a service ended; true if it failed.
fn report(joined: Result<(&'static str, Result<()>), tokio::task::JoinError>) -> bool {
    match joined {
        Ok((name, Ok(()))) => {
            info!(service = name, "service stopped");
            false
        }
        Ok((name, Err(e))) => {
            error!(service = name, error = %format!("{e:#}"), "service failed");
            true
        }
        Err(e) => {
            error!(error = %e, "service task panicked");
            true
        }
    }
}

/// Feed → trade topic.
async fn run_trade_service(
    config: PipelineConfig,
    bus: MemoryBus,
    stats: Arc<PipelineStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let producer = retry_async("trade producer", config.retry.backoff(), || {
        std::future::ready(bus.producer().map_err(anyhow::Error::from))
    })
    .await?;

    let mut feed = tokio::select! {
        _ = shutdown.changed() => return Ok(()),
        connected = feed::connect(&config, stats.clone()) => connected?,
    };

    let relay = TradeRelay::new(
        Arc::new(producer),
        config.trade_topic.clone(),
        config.retry.backoff(),
        stats,
    );
    relay.run(feed.as_mut(), shutdown).await
}

/// Trade topic → window store → candle topic.
async fn run_aggregation_service(
    config: PipelineConfig,
    bus: MemoryBus,
    stats: Arc<PipelineStats>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let open_clients = || -> Result<(MemoryProducer, MemoryConsumer)> {
        let producer = bus.producer()?;
        let consumer = bus.consumer(&config.consumer_group, &config.trade_topic)?;
        Ok((producer, consumer))
    };
    let (producer, mut consumer) = retry_async("candle bus clients", config.retry.backoff(), || {
        std::future::ready(open_clients())
    })
    .await?;
    info!(
        group = %config.consumer_group,
        member = %consumer.member_id(),
        window_ms = config.window_ms(),
        "aggregation consumer ready"
    );

    let store = WindowStore::new(config.window_ms(), config.grace_ms());
    let mut aggregator = CandleAggregator::new(store, stats.clone());
    let relay = CandleRelay::new(
        Arc::new(producer),
        config.candle_topic.clone(),
        config.retry.backoff(),
        stats.clone(),
    );

    run_candle_service(&mut consumer, &mut aggregator, &relay, &stats, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Consumer;
    use std::time::Duration;

    #[test]
    fn service_argument_parsing() {
        assert_eq!(Service::parse(None).unwrap(), Service::All);
        assert_eq!(Service::parse(Some("Trades")).unwrap(), Service::Trades);
        assert_eq!(Service::parse(Some("candles")).unwrap(), Service::Candles);
        assert!(Service::parse(Some("orders")).is_err());
        assert!(Service::Trades.runs_trades() && !Service::Trades.runs_candles());
        assert!(Service::All.runs_trades() && Service::All.runs_candles());
    }

    #[test]
    fn single_service_modes_warn_about_isolated_bus() {
        assert!(Service::All.isolation_warning().is_none());
        assert!(Service::Trades.isolation_warning().unwrap().contains("no candle service"));
        assert!(Service::Candles.isolation_warning().unwrap().contains("no trade service"));
    }

    /// Mock feed → trade relay → bus → aggregator → candle relay → bus.
    #[tokio::test]
    async fn mock_pipeline_end_to_end() {
        let mut config = PipelineConfig::default();
        config.feed = runtime_config::FeedMode::Mock;
        config.mock_delay_ms = 5;
        config.pairs = vec!["BTC/USD".into(), "ETH/USD".into()];

        let stats = Arc::new(PipelineStats::new());
        let bus = MemoryBus::new(config.partitions, config.retention_per_partition);
        let (tx, rx) = watch::channel(false);

        let trades = tokio::spawn(run_trade_service(config.clone(), bus.clone(), stats.clone(), rx.clone()));
        let candles = tokio::spawn(run_aggregation_service(config.clone(), bus.clone(), stats.clone(), rx));

        let mut reader = bus.consumer("e2e", &config.candle_topic).unwrap();
        let mut seen = Vec::new();
        while seen.len() < 8 {
            let msg = tokio::time::timeout(Duration::from_secs(5), reader.poll())
                .await
                .expect("candle arrived")
                .unwrap()
                .unwrap();
            let candle: types::Candle = serde_json::from_slice(&msg.payload).unwrap();
            assert_eq!(msg.key, candle.pair);
            seen.push(candle);
        }

        tx.send(true).unwrap();
        trades.await.unwrap().unwrap();
        candles.await.unwrap().unwrap();

        // The mock replays the same two trades, so the single window of each
        // pair keeps growing.
        let btc: Vec<_> = seen.iter().filter(|c| c.pair == "BTC/USD").collect();
        assert!(btc.len() >= 2);
        assert!(btc.iter().all(|c| c.window_start_ms == 1_234_560_000));
        assert_eq!(btc[0].open, 10000.0);
        assert_eq!(btc[1].high, 10001.0);
        assert!(btc.windows(2).all(|w| w[1].volume > w[0].volume));
    }
}
