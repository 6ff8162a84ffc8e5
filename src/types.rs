// =============================================================================
// Shared types used across the trade and candle services
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a trade cannot be constructed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeError {
    #[error("trade price must be positive, got {0}")]
    NonPositivePrice(f64),
    #[error("trade volume must not be negative, got {0}")]
    NegativeVolume(f64),
    #[error("trade pair must not be empty")]
    EmptyPair,
    #[error("trade timestamp {0} ms is outside the representable range")]
    TimestampOutOfRange(i64),
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// A single executed trade reported by the upstream feed.
///
/// Fields are private so that every `Trade` in the system has passed
/// [`Trade::new`]; deserialisation goes through the same check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TradeWire")]
pub struct Trade {
    pair: String,
    price: f64,
    volume: f64,
    timestamp: DateTime<Utc>,
    timestamp_ms: i64,
}

#[derive(Deserialize)]
struct TradeWire {
    pair: String,
    price: f64,
    volume: f64,
    timestamp: DateTime<Utc>,
    timestamp_ms: i64,
}

impl TryFrom<TradeWire> for Trade {
    type Error = TradeError;

    fn try_from(w: TradeWire) -> Result<Self, Self::Error> {
        Trade::new(w.pair, w.price, w.volume, w.timestamp, w.timestamp_ms)
    }
}

impl Trade {
    pub fn new(
        pair: impl Into<String>,
        price: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
        timestamp_ms: i64,
    ) -> Result<Self, TradeError> {
        let pair = pair.into();
        if pair.is_empty() {
            return Err(TradeError::EmptyPair);
        }
        // `!(x > 0)` also rejects NaN.
        if !(price > 0.0) {
            return Err(TradeError::NonPositivePrice(price));
        }
        if !(volume >= 0.0) {
            return Err(TradeError::NegativeVolume(volume));
        }
        // Bounds event time to what `DateTime<Utc>` covers, which keeps
        // window arithmetic far from i64 overflow.
        if DateTime::<Utc>::from_timestamp_millis(timestamp_ms).is_none() {
            return Err(TradeError::TimestampOutOfRange(timestamp_ms));
        }
        Ok(Self {
            pair,
            price,
            volume,
            timestamp,
            timestamp_ms,
        })
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of an in-progress (or finished) window.
///
/// `timestamp_ms` is the event time of the trade that produced this
/// snapshot, not a window boundary. A consumer knows a window is finished
/// once a candle with a later `window_start_ms` arrives for the same pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub pair: String,
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn rejects_invalid_price_and_volume() {
        assert_eq!(
            Trade::new("BTC/USD", 0.0, 1.0, ts(0), 0),
            Err(TradeError::NonPositivePrice(0.0))
        );
        assert!(matches!(
            Trade::new("BTC/USD", f64::NAN, 1.0, ts(0), 0),
            Err(TradeError::NonPositivePrice(_))
        ));
        assert_eq!(
            Trade::new("BTC/USD", 1.0, -0.5, ts(0), 0),
            Err(TradeError::NegativeVolume(-0.5))
        );
        assert_eq!(Trade::new("", 1.0, 1.0, ts(0), 0), Err(TradeError::EmptyPair));
    }

    #[test]
    fn rejects_unrepresentable_event_time() {
        assert_eq!(
            Trade::new("BTC/USD", 1.0, 1.0, ts(0), i64::MAX),
            Err(TradeError::TimestampOutOfRange(i64::MAX))
        );
        assert!(Trade::new("BTC/USD", 1.0, 1.0, ts(0), i64::MIN).is_err());

        let json = format!(
            r#"{{"pair":"BTC/USD","price":1.0,"volume":0.1,
                "timestamp":"2024-01-01T00:00:00Z","timestamp_ms":{}}}"#,
            i64::MAX
        );
        assert!(serde_json::from_str::<Trade>(&json).is_err());
    }

    #[test]
    fn zero_volume_is_allowed() {
        let t = Trade::new("ETH/USD", 2000.0, 0.0, ts(5), 5).unwrap();
        assert_eq!(t.volume(), 0.0);
    }

    #[test]
    fn trade_wire_format_has_expected_fields() {
        let t = Trade::new("BTC/USD", 10000.0, 0.1, ts(1_700_000_000_123), 1_700_000_000_123)
            .unwrap();
        let v: serde_json::Value = serde_json::to_value(&t).unwrap();
        assert_eq!(v["pair"], "BTC/USD");
        assert_eq!(v["price"], 10000.0);
        assert_eq!(v["volume"], 0.1);
        assert_eq!(v["timestamp_ms"], 1_700_000_000_123i64);
        assert!(v["timestamp"].as_str().unwrap().starts_with("2023-11-14T22:13:20.123"));
    }

    #[test]
    fn deserialising_invalid_trade_fails() {
        let json = r#"{"pair":"BTC/USD","price":-1.0,"volume":0.1,
                       "timestamp":"2024-01-01T00:00:00Z","timestamp_ms":1704067200000}"#;
        assert!(serde_json::from_str::<Trade>(json).is_err());
    }

    #[test]
    fn candle_survives_json() {
        let candle = Candle {
            pair: "BTC-USD".into(),
            timestamp_ms: 59_999,
            open: 10000.0,
            high: 10005.0,
            low: 9990.0,
            close: 10002.0,
            volume: 0.45,
            window_start_ms: 0,
            window_end_ms: 60_000,
        };
        let json = serde_json::to_string(&candle).unwrap();
        let back: Candle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, candle);
    }
}
