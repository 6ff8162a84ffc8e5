// =============================================================================
// Kraken Trade Feed: websocket v2 `trade` channel
// =============================================================================
//
// Connects, subscribes once per pair and then turns every text frame into a
// (possibly empty) batch of trades. A dropped socket is re-established with
// the same subscription handshake under exponential backoff; only when the
// backoff budget is spent does `next_batch` return an error.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::TradeFeed;
use crate::app_state::PipelineStats;
use crate::retry::{retry_async, ExponentialBackoff};
use crate::types::Trade;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames the server sends in answer to each subscribe request.
const ACKS_PER_PAIR: usize = 2;
/// Upper bound on waiting for a single acknowledgement frame.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// Why a frame produced no trades.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("heartbeat frame")]
    Heartbeat,
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has no `data` trade list")]
    MissingData,
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    symbol: String,
    price: f64,
    qty: f64,
    timestamp: String,
}

/// Outcome of parsing one trade frame.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    pub trades: Vec<Trade>,
    /// Entries dropped because they were incomplete or violated trade
    /// invariants.
    pub rejected: usize,
}

/// Parse one text frame.
///
/// Expected shape:
/// ```json
/// { "channel": "trade", "type": "update",
///   "data": [ { "symbol": "BTC/USD", "price": 37000.1, "qty": 0.01,
///               "timestamp": "2023-09-25T07:49:37.708706Z" } ] }
/// ```
pub fn parse_frame(text: &str) -> Result<ParsedFrame, FrameError> {
    if text.contains("heartbeat") {
        return Err(FrameError::Heartbeat);
    }

    let root: serde_json::Value = serde_json::from_str(text).map_err(FrameError::InvalidJson)?;
    let entries = root
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or(FrameError::MissingData)?;

    let mut parsed = ParsedFrame::default();
    for entry in entries {
        match parse_entry(entry) {
            Ok(trade) => parsed.trades.push(trade),
            Err(e) => {
                warn!(error = %e, entry = %entry, "skipping trade entry");
                parsed.rejected += 1;
            }
        }
    }
    Ok(parsed)
}

fn parse_entry(entry: &serde_json::Value) -> Result<Trade> {
    let e = TradeEntry::deserialize(entry).context("malformed trade entry")?;
    let (timestamp, timestamp_ms) = parse_timestamp(&e.timestamp)?;
    Ok(Trade::new(e.symbol, e.price, e.qty, timestamp, timestamp_ms)?)
}

/// Convert an ISO-8601 UTC timestamp (`2023-09-25T07:49:37.708706Z`) to the
/// instant and its Unix time in milliseconds, floored.
pub fn parse_timestamp(iso: &str) -> Result<(DateTime<Utc>, i64)> {
    let dt = DateTime::parse_from_rfc3339(iso)
        .with_context(|| format!("invalid trade timestamp {iso:?}"))?
        .with_timezone(&Utc);
    // `timestamp_millis` is floor(seconds) * 1000 + whole sub-second millis,
    // i.e. an exact floor also for instants before 1970.
    Ok((dt, dt.timestamp_millis()))
}

fn subscribe_message(pair: &str) -> String {
    serde_json::json!({
        "method": "subscribe",
        "params": {
            "channel": "trade",
            "symbol": [pair],
            "snapshot": true
        }
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Open the socket and run the subscription handshake for every pair.
async fn open_and_subscribe(url: &str, pairs: &[String]) -> Result<WsStream> {
    info!(url = %url, "connecting to trade WebSocket");
    let (mut ws, _response) = connect_async(url)
        .await
        .context("failed to connect to trade WebSocket")?;
    info!(url = %url, "trade WebSocket connected");

    for pair in pairs {
        ws.send(Message::Text(subscribe_message(pair)))
            .await
            .with_context(|| format!("failed to send subscription for {pair}"))?;
        info!(pair = %pair, "subscription sent");

        let mut acks = 0;
        while acks < ACKS_PER_PAIR {
            let frame = tokio::time::timeout(ACK_TIMEOUT, ws.next())
                .await
                .with_context(|| format!("timed out waiting for {pair} subscription ack"))?;
            match frame {
                Some(Ok(Message::Text(text))) => {
                    debug!(pair = %pair, frame = %text, "subscription ack");
                    acks += 1;
                }
                Some(Ok(Message::Close(close))) => {
                    bail!("server closed the socket during subscription: {close:?}")
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(e).context("read error during subscription handshake")
                }
                None => bail!("socket ended during subscription handshake"),
            }
        }
        info!(pair = %pair, "subscribed to trades");
    }
    Ok(ws)
}

pub struct KrakenFeed {
    url: String,
    pairs: Vec<String>,
    ws: WsStream,
    backoff: ExponentialBackoff,
    stats: Arc<PipelineStats>,
}

impl KrakenFeed {
    /// Connect and subscribe, retrying per `backoff`. Exhausting the backoff
    /// is returned to the caller as an error.
    pub async fn connect(
        url: &str,
        pairs: &[String],
        backoff: ExponentialBackoff,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let ws = retry_async("feed connect", backoff.clone(), || open_and_subscribe(url, pairs)).await?;
        Ok(Self {
            url: url.to_string(),
            pairs: pairs.to_vec(),
            ws,
            backoff,
            stats,
        })
    }

    async fn reconnect(&mut self) -> Result<()> {
        warn!(url = %self.url, "trade WebSocket lost, reconnecting");
        let url = self.url.clone();
        let pairs = self.pairs.clone();
        self.ws = retry_async("feed reconnect", self.backoff.clone(), || open_and_subscribe(&url, &pairs))
            .await
            .context("trade feed could not be re-established")?;
        PipelineStats::bump(&self.stats.feed_reconnects);
        Ok(())
    }

    fn handle_text(&self, text: &str) -> Vec<Trade> {
        PipelineStats::bump(&self.stats.frames_received);
        debug!(frame = %text, "received frame");
        match parse_frame(text) {
            Ok(parsed) => {
                PipelineStats::add(&self.stats.rejected_entries, parsed.rejected as u64);
                parsed.trades
            }
            Err(FrameError::Heartbeat) => {
                debug!("heartbeat received");
                PipelineStats::bump(&self.stats.heartbeats);
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "discarding frame");
                PipelineStats::bump(&self.stats.malformed_frames);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl TradeFeed for KrakenFeed {
    async fn next_batch(&mut self) -> Result<Vec<Trade>> {
        match self.ws.next().await {
            Some(Ok(Message::Text(text))) => Ok(self.handle_text(&text)),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "trade WebSocket closed by server");
                self.reconnect().await?;
                Ok(Vec::new())
            }
            // Ping / Pong / Binary: tungstenite answers pings itself.
            Some(Ok(_)) => Ok(Vec::new()),
            Some(Err(e)) => {
                error!(error = %e, "trade WebSocket read error");
                self.reconnect().await?;
                Ok(Vec::new())
            }
            None => {
                warn!("trade WebSocket stream ended");
                self.reconnect().await?;
                Ok(Vec::new())
            }
        }
    }

    fn name(&self) -> &'static str {
        "kraken"
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const TRADE_FRAME: &str = r#"{
        "channel": "trade",
        "type": "update",
        "data": [
            { "symbol": "BTC/USD", "side": "buy", "price": 37000.1, "qty": 0.01,
              "ord_type": "market", "trade_id": 1, "timestamp": "2023-09-25T07:49:37.708706Z" },
            { "symbol": "BTC/USD", "side": "sell", "price": 36999.9, "qty": 0.5,
              "ord_type": "limit", "trade_id": 2, "timestamp": "2023-09-25T07:49:37.709999Z" }
        ]
    }"#;

    #[test]
    fn parses_trade_frame() {
        let parsed = parse_frame(TRADE_FRAME).unwrap();
        assert_eq!(parsed.rejected, 0);
        assert_eq!(parsed.trades.len(), 2);
        let t = &parsed.trades[0];
        assert_eq!(t.pair(), "BTC/USD");
        assert!((t.price() - 37000.1).abs() < 1e-9);
        assert!((t.volume() - 0.01).abs() < 1e-12);
        assert_eq!(t.timestamp_ms(), 1_695_628_177_708);
        // .709999 floors to 709, it does not round up
        assert_eq!(parsed.trades[1].timestamp_ms(), 1_695_628_177_709);
    }

    #[test]
    fn heartbeat_is_recognised_before_parsing() {
        assert!(matches!(
            parse_frame(r#"{"channel":"heartbeat"}"#),
            Err(FrameError::Heartbeat)
        ));
    }

    #[test]
    fn malformed_frames_are_classified() {
        assert!(matches!(parse_frame("not json"), Err(FrameError::InvalidJson(_))));
        assert!(matches!(
            parse_frame(r#"{"method":"subscribe","success":true}"#),
            Err(FrameError::MissingData)
        ));
        assert!(matches!(
            parse_frame(r#"{"channel":"status","data":{"system":"online"}}"#),
            Err(FrameError::MissingData)
        ));
    }

    #[test]
    fn bad_entries_are_skipped_not_fatal() {
        let frame = r#"{"data":[
            {"symbol":"ETH/USD","price":2000.0,"qty":1.0,"timestamp":"2024-01-01T00:00:00.000Z"},
            {"symbol":"ETH/USD","price":-5.0,"qty":1.0,"timestamp":"2024-01-01T00:00:00.000Z"},
            {"symbol":"ETH/USD","price":2001.0,"timestamp":"2024-01-01T00:00:00.000Z"},
            {"symbol":"ETH/USD","price":2002.0,"qty":1.0,"timestamp":"yesterday"}
        ]}"#;
        let parsed = parse_frame(frame).unwrap();
        assert_eq!(parsed.trades.len(), 1);
        assert_eq!(parsed.rejected, 3);
    }

    #[test]
    fn timestamp_floor_before_epoch() {
        let (_, ms) = parse_timestamp("1969-12-31T23:59:59.9995Z").unwrap();
        assert_eq!(ms, -1);
        let (dt, ms) = parse_timestamp("1970-01-01T00:00:00.000999Z").unwrap();
        assert_eq!(ms, 0);
        assert_eq!(dt.timestamp_subsec_micros(), 999);
    }

    #[test]
    fn subscribe_message_shape() {
        let v: serde_json::Value = serde_json::from_str(&subscribe_message("BTC/USD")).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "method": "subscribe",
                "params": { "channel": "trade", "symbol": ["BTC/USD"], "snapshot": true }
            })
        );
    }

    /// Websocket server that, per accepted connection, acknowledges a single
    /// subscribe with two frames and then plays `script`. Subscribe requests
    /// are forwarded to the returned channel.
    async fn spawn_server(
        scripts: Vec<Vec<&'static str>>,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for script in scripts {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                if let Some(Ok(Message::Text(sub))) = ws.next().await {
                    tx.send(sub).unwrap();
                }
                ws.send(Message::Text(r#"{"method":"subscribe","success":true}"#.into()))
                    .await
                    .unwrap();
                ws.send(Message::Text(r#"{"channel":"trade","type":"snapshot","data":[]}"#.into()))
                    .await
                    .unwrap();
                for frame in script {
                    ws.send(Message::Text(frame.into())).await.unwrap();
                }
                // Dropping `ws` ends this connection.
                let _ = ws.close(None).await;
            }
        });

        (format!("ws://{addr}"), rx)
    }

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(20), 2.0, 3)
    }

    #[tokio::test]
    async fn live_feed_handshake_and_batches() {
        let (url, mut subs) = spawn_server(vec![vec![
            r#"{"channel":"heartbeat"}"#,
            "{{{",
            r#"{"channel":"status"}"#,
            TRADE_FRAME,
        ]])
        .await;

        let stats = Arc::new(PipelineStats::new());
        let mut feed = KrakenFeed::connect(&url, &["BTC/USD".to_string()], fast_backoff(), stats.clone())
            .await
            .unwrap();

        let sub: serde_json::Value = serde_json::from_str(&subs.recv().await.unwrap()).unwrap();
        assert_eq!(sub["params"]["symbol"][0], "BTC/USD");

        assert!(feed.next_batch().await.unwrap().is_empty()); // heartbeat
        assert!(feed.next_batch().await.unwrap().is_empty()); // garbage
        assert!(feed.next_batch().await.unwrap().is_empty()); // no data
        let trades = feed.next_batch().await.unwrap();
        assert_eq!(trades.len(), 2);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 4);
        assert_eq!(snap.heartbeats, 1);
        assert_eq!(snap.malformed_frames, 2);
    }

    #[tokio::test]
    async fn live_feed_reconnects_after_drop() {
        let (url, mut subs) = spawn_server(vec![vec![], vec![TRADE_FRAME]]).await;

        let stats = Arc::new(PipelineStats::new());
        let mut feed = KrakenFeed::connect(&url, &["BTC/USD".to_string()], fast_backoff(), stats.clone())
            .await
            .unwrap();

        // Drain frames until the trades from the second connection show up.
        let mut trades = Vec::new();
        for _ in 0..5 {
            trades = feed.next_batch().await.unwrap();
            if !trades.is_empty() {
                break;
            }
        }
        assert_eq!(trades.len(), 2);
        assert_eq!(stats.snapshot().feed_reconnects, 1);

        // Both connections subscribed.
        assert!(subs.recv().await.is_some());
        assert!(subs.recv().await.is_some());
    }

    /// Server that reads the subscribe on every connection and then ends it
    /// without acknowledging, either with a close frame or by dropping the
    /// socket. Returns the URL and a count of accepted connections.
    async fn spawn_refusing_server(send_close: bool) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                let _ = ws.next().await;
                if send_close {
                    let _ = ws.close(None).await;
                }
            }
        });

        (format!("ws://{addr}"), accepted)
    }

    #[tokio::test]
    async fn handshake_failures_exhaust_backoff() {
        for send_close in [true, false] {
            let (url, accepted) = spawn_refusing_server(send_close).await;
            let stats = Arc::new(PipelineStats::new());

            let res = tokio::time::timeout(
                Duration::from_secs(5),
                KrakenFeed::connect(&url, &["BTC/USD".to_string()], fast_backoff(), stats),
            )
            .await
            .expect("connect gave up");

            let err = res.err().expect("handshake must fail");
            assert!(format!("{err:#}").contains("giving up after 3 retries"));
            // one initial attempt plus three retries
            assert_eq!(accepted.load(Ordering::SeqCst), 4);
        }
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let stats = Arc::new(PipelineStats::new());
        let res = KrakenFeed::connect(&format!("ws://{addr}"), &["BTC/USD".to_string()], fast_backoff(), stats).await;
        assert!(res.is_err());
    }
}
