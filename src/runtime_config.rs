// =============================================================================
// Pipeline Configuration: JSON file + environment overrides
// =============================================================================
//
// Every field carries `#[serde(default)]` so that a partial (or missing)
// config file still yields a usable configuration. Environment variables are
// applied on top, which keeps the variable names the services have always
// been deployed with (`KAFKA_BROKER_ADDRESS`, `PAIRS`, ...).
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::retry::ExponentialBackoff;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_broker_address() -> String {
    "localhost:19092".to_string()
}

fn default_trade_topic() -> String {
    "trades".to_string()
}

fn default_candle_topic() -> String {
    "candles".to_string()
}

fn default_consumer_group() -> String {
    "candles-consumer-group".to_string()
}

fn default_candle_seconds() -> u64 {
    60
}

fn default_pairs() -> Vec<String> {
    vec!["BTC/USD".to_string()]
}

fn default_feed_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

fn default_mock_delay_ms() -> u64 {
    1000
}

fn default_grace_seconds() -> u64 {
    10
}

fn default_partitions() -> usize {
    8
}

fn default_retention() -> usize {
    100_000
}

fn default_status_addr() -> String {
    "0.0.0.0:3002".to_string()
}

// =============================================================================
// FeedMode
// =============================================================================

/// Which trade source the ingestion service connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    #[default]
    Live,
    Mock,
}

impl std::str::FromStr for FeedMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown feed mode {other:?} (expected `live` or `mock`)"),
        }
    }
}

impl std::fmt::Display for FeedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

// =============================================================================
// RetryConfig
// =============================================================================

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_attempts() -> u32 {
    8
}

/// Backoff parameters shared by feed reconnects, bus acquisition and
/// publish retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    /// Attempts before a failure is treated as fatal.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_retry_base_ms(),
            max_ms: default_retry_max_ms(),
            factor: default_retry_factor(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms),
            self.factor,
            self.max_attempts,
        )
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for both services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Message bus ---------------------------------------------------------

    /// Address of the bus broker. Reported in logs; the in-process bus does
    /// not dial it.
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    /// Topic the trade service writes and the candle service reads.
    #[serde(default = "default_trade_topic")]
    pub trade_topic: String,

    #[serde(default = "default_candle_topic")]
    pub candle_topic: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Partitions per topic. Messages sharing a key always share a partition.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Messages retained per partition before the oldest are discarded.
    #[serde(default = "default_retention")]
    pub retention_per_partition: usize,

    // --- Candles -------------------------------------------------------------

    /// Tumbling window length in seconds.
    #[serde(default = "default_candle_seconds")]
    pub candle_seconds: u64,

    /// How long past its end (in event time) a window stays open for late
    /// trades before it is evicted.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,

    // --- Feed ----------------------------------------------------------------

    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,

    #[serde(default)]
    pub feed: FeedMode,

    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Artificial delay between mock batches.
    #[serde(default = "default_mock_delay_ms")]
    pub mock_delay_ms: u64,

    // --- Operational ---------------------------------------------------------

    #[serde(default)]
    pub retry: RetryConfig,

    /// Bind address of the status endpoint.
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker_address: default_broker_address(),
            trade_topic: default_trade_topic(),
            candle_topic: default_candle_topic(),
            consumer_group: default_consumer_group(),
            partitions: default_partitions(),
            retention_per_partition: default_retention(),
            candle_seconds: default_candle_seconds(),
            grace_seconds: default_grace_seconds(),
            pairs: default_pairs(),
            feed: FeedMode::default(),
            feed_url: default_feed_url(),
            mock_delay_ms: default_mock_delay_ms(),
            retry: RetryConfig::default(),
            status_addr: default_status_addr(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(path = %path.display(), pairs = ?config.pairs, "pipeline config loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup. Split out of [`apply_env`]
    /// so tests do not have to mutate the process environment.
    ///
    /// [`apply_env`]: Self::apply_env
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("KAFKA_BROKER_ADDRESS") {
            self.broker_address = v;
        }
        // The trade service historically used KAFKA_TOPIC for its output; the
        // candle service calls the same topic KAFKA_INPUT_TOPIC.
        if let Some(v) = var("KAFKA_TOPIC").or_else(|| var("KAFKA_INPUT_TOPIC")) {
            self.trade_topic = v;
        }
        if let Some(v) = var("KAFKA_OUTPUT_TOPIC") {
            self.candle_topic = v;
        }
        if let Some(v) = var("KAFKA_CONSUMER_GROUP") {
            self.consumer_group = v;
        }
        if let Some(v) = var("CANDLE_SECONDS") {
            self.candle_seconds = v
                .trim()
                .parse()
                .with_context(|| format!("CANDLE_SECONDS is not an integer: {v}"))?;
        }
        if let Some(v) = var("GRACE_SECONDS") {
            self.grace_seconds = v
                .trim()
                .parse()
                .with_context(|| format!("GRACE_SECONDS is not an integer: {v}"))?;
        }
        if let Some(v) = var("PAIRS") {
            self.pairs = parse_pairs(&v)?;
        }
        if let Some(v) = var("FEED_MODE") {
            self.feed = v.parse()?;
        }
        if let Some(v) = var("FEED_URL") {
            self.feed_url = v;
        }
        if let Some(v) = var("STATUS_ADDR") {
            self.status_addr = v;
        }
        Ok(())
    }

    /// Reject configurations the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.candle_seconds == 0 {
            bail!("candle_seconds must be greater than zero");
        }
        if self.pairs.is_empty() {
            bail!("at least one trading pair must be configured");
        }
        if self.partitions == 0 {
            bail!("partitions must be greater than zero");
        }
        if self.retention_per_partition == 0 {
            bail!("retention_per_partition must be greater than zero");
        }
        if self.trade_topic == self.candle_topic {
            warn!(topic = %self.trade_topic, "trade and candle topics are identical");
        }
        Ok(())
    }

    pub fn window_ms(&self) -> i64 {
        (self.candle_seconds as i64).saturating_mul(1000)
    }

    pub fn grace_ms(&self) -> i64 {
        (self.grace_seconds as i64).saturating_mul(1000)
    }
}

/// Accept either a JSON array (`["BTC/USD","ETH/USD"]`) or a comma list.
pub fn parse_pairs(raw: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    let pairs: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).with_context(|| format!("PAIRS is not a JSON list: {raw}"))?
    } else {
        trimmed.split(',').map(str::to_string).collect()
    };
    Ok(pairs
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.trade_topic, "trades");
        assert_eq!(cfg.candle_topic, "candles");
        assert_eq!(cfg.candle_seconds, 60);
        assert_eq!(cfg.window_ms(), 60_000);
        assert_eq!(cfg.grace_ms(), 10_000);
        assert_eq!(cfg.feed, FeedMode::Live);
        assert_eq!(cfg.retry.max_attempts, 8);
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "pairs": ["ETH/USD"], "feed": "mock", "retry": { "max_attempts": 2 } }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.pairs, vec!["ETH/USD"]);
        assert_eq!(cfg.feed, FeedMode::Mock);
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.base_ms, 500);
        assert_eq!(cfg.consumer_group, "candles-consumer-group");
    }

    #[test]
    fn env_overrides_are_applied() {
        let vars: HashMap<&str, &str> = [
            ("KAFKA_BROKER_ADDRESS", "redpanda:9092"),
            ("KAFKA_INPUT_TOPIC", "trade_events"),
            ("KAFKA_OUTPUT_TOPIC", "candle_events"),
            ("CANDLE_SECONDS", "5"),
            ("PAIRS", r#"["BTC/USD", "ETH/EUR"]"#),
            ("FEED_MODE", "Mock"),
        ]
        .into_iter()
        .collect();

        let mut cfg = PipelineConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.broker_address, "redpanda:9092");
        assert_eq!(cfg.trade_topic, "trade_events");
        assert_eq!(cfg.candle_topic, "candle_events");
        assert_eq!(cfg.window_ms(), 5_000);
        assert_eq!(cfg.pairs, vec!["BTC/USD", "ETH/EUR"]);
        assert_eq!(cfg.feed, FeedMode::Mock);
    }

    #[test]
    fn bad_numeric_override_is_an_error() {
        let mut cfg = PipelineConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "CANDLE_SECONDS").then(|| "sixty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CANDLE_SECONDS"));
    }

    #[test]
    fn pairs_accept_comma_list() {
        assert_eq!(
            parse_pairs(" BTC/USD, ETH/USD ,,").unwrap(),
            vec!["BTC/USD", "ETH/USD"]
        );
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut cfg = PipelineConfig::default();
        cfg.candle_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.pairs.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.partitions = 0;
        assert!(cfg.validate().is_err());
    }
}
