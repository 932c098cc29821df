//! In-memory fake of the Deriv WebSocket endpoint.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use market_feed::{Connection, ConnectionError, Connector, FeedSettings, LinkError};

/// How long a test waits for the pipeline to act.
pub const STEP: Duration = Duration::from_secs(2);

/// Settings tuned for tests: fast reconnects, quiet keep-alive.
pub fn test_settings() -> FeedSettings {
    let mut settings = FeedSettings::default();
    settings.endpoint.url = Some("wss://fake.invalid/websockets/v3".to_string());
    settings.connection.reconnect_delay_initial = Duration::from_millis(10);
    settings.connection.reconnect_delay_max = Duration::from_millis(20);
    settings.connection.reconnect_jitter = 0.0;
    settings.connection.max_reconnect_attempts = 3;
    settings.connection.heartbeat_interval = Duration::from_secs(600);
    settings.connection.heartbeat_timeout = Duration::from_secs(1200);
    settings.requests.timeout = Duration::from_secs(5);
    settings.requests.unsubscribe_grace = Duration::from_millis(500);
    settings
}

/// Connector handing every accepted socket to the test.
pub struct FakeUpstream {
    sockets: mpsc::UnboundedSender<FakeSocket>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl FakeUpstream {
    /// Create the fake and the receiver of its sockets.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeSocket>) {
        let (sockets, rx) = mpsc::unbounded_channel();
        let upstream = Arc::new(Self {
            sockets,
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        });
        (upstream, rx)
    }

    /// Make subsequent handshakes fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Handshakes attempted so far.
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeUpstream {
    async fn connect(&self, _url: &str) -> Result<Connection, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Handshake("HTTP 503".to_string()));
        }

        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<String, LinkError>>();
        let sink = out_tx.sink_map_err(|e| LinkError(e.to_string()));

        let _ = self.sockets.send(FakeSocket {
            written: out_rx,
            inbound: in_tx,
        });
        Ok(Connection::new(Box::pin(sink), Box::pin(in_rx)))
    }
}

/// The upstream end of one accepted socket.
pub struct FakeSocket {
    written: fmpsc::UnboundedReceiver<String>,
    inbound: fmpsc::UnboundedSender<Result<String, LinkError>>,
}

impl FakeSocket {
    /// Next request written by the client, skipping keep-alive pings.
    pub async fn next_request(&mut self) -> Value {
        tokio::time::timeout(STEP, async {
            loop {
                let text = self.written.next().await.expect("socket closed");
                let value: Value = serde_json::from_str(&text).unwrap();
                if value.get("ping").is_none() {
                    return value;
                }
            }
        })
        .await
        .expect("no request written")
    }

    /// A request already written, if any.
    pub fn try_next_request(&mut self) -> Option<Value> {
        while let Ok(Some(text)) = self.written.try_next() {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value.get("ping").is_none() {
                return Some(value);
            }
        }
        None
    }

    /// Send a raw text frame to the client.
    pub fn send_raw(&self, text: &str) {
        self.inbound.unbounded_send(Ok(text.to_string())).unwrap();
    }

    /// Send a JSON frame to the client.
    pub fn send(&self, frame: &Value) {
        self.send_raw(&frame.to_string());
    }

    /// Drop the socket with a read error.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .inbound
            .unbounded_send(Err(LinkError(reason.to_string())));
    }

    // =========================================================================
    // Canned Responses
    // =========================================================================

    /// Acknowledge a candle subscription with a history batch.
    pub fn ack_subscribe(&self, request: &Value, handle: &str, history: &[i64]) {
        let candles: Vec<Value> = history.iter().map(|epoch| candle(*epoch, 100)).collect();
        self.send(&json!({
            "msg_type": "candles",
            "req_id": request["req_id"],
            "echo_req": request,
            "candles": candles,
            "subscription": { "id": handle },
        }));
    }

    /// Answer a history request without a subscription.
    pub fn reply_history(&self, request: &Value, history: &[i64]) {
        let candles: Vec<Value> = history.iter().map(|epoch| candle(*epoch, 100)).collect();
        self.send(&json!({
            "msg_type": "candles",
            "req_id": request["req_id"],
            "candles": candles,
        }));
    }

    /// Acknowledge a forget request.
    pub fn ack_forget(&self, request: &Value) {
        self.send(&json!({
            "msg_type": "forget",
            "req_id": request["req_id"],
            "forget": 1,
        }));
    }

    /// Fail a request with an upstream error.
    pub fn reply_error(&self, request: &Value, code: &str, message: &str) {
        self.send(&json!({
            "msg_type": request_msg_type(request),
            "req_id": request["req_id"],
            "error": { "code": code, "message": message },
        }));
    }

    /// Answer a catalog request.
    pub fn reply_catalog(&self, request: &Value, instruments: &[Value]) {
        self.send(&json!({
            "msg_type": "active_symbols",
            "req_id": request["req_id"],
            "active_symbols": instruments,
        }));
    }

    /// Stream one candle update.
    pub fn stream_ohlc(&self, symbol: &str, handle: &str, epoch: i64, close: i64) {
        self.send(&json!({
            "msg_type": "ohlc",
            "ohlc": {
                "symbol": symbol,
                "epoch": epoch,
                "open_time": epoch - epoch % 60,
                "granularity": 60,
                "open": "100.00",
                "high": format!("{close}.50"),
                "low": "99.50",
                "close": format!("{close}.00"),
                "id": handle,
            },
            "subscription": { "id": handle },
        }));
    }
}

/// One catalog entry.
pub fn instrument(symbol: &str, market: &str, symbol_type: &str, forward: u8) -> Value {
    json!({
        "symbol": symbol,
        "display_name": symbol,
        "market": market,
        "symbol_type": symbol_type,
        "allow_forward_starting": forward,
    })
}

fn candle(epoch: i64, close: i64) -> Value {
    json!({
        "epoch": epoch,
        "open": close,
        "high": close,
        "low": close,
        "close": close,
    })
}

fn request_msg_type(request: &Value) -> &'static str {
    if request.get("ticks_history").is_some() {
        "ticks_history"
    } else if request.get("forget").is_some() {
        "forget"
    } else {
        "active_symbols"
    }
}

/// Wait for the next socket the client opens.
pub async fn next_socket(sockets: &mut mpsc::UnboundedReceiver<FakeSocket>) -> FakeSocket {
    tokio::time::timeout(STEP, sockets.recv())
        .await
        .expect("no connection attempt")
        .expect("upstream dropped")
}

/// Poll `condition` until it holds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(STEP, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Round-trip a catalog request so every frame sent before it has been
/// dispatched.
pub async fn flush(session: &market_feed::MarketDataSession, socket: &mut FakeSocket) {
    let catalog = session.catalog().clone();
    let fetch = tokio::spawn(async move {
        catalog
            .fetch_catalog(&market_feed::CatalogFilter::any())
            .await
    });
    let request = socket.next_request().await;
    assert_eq!(request["active_symbols"], "brief");
    socket.reply_catalog(&request, &[]);
    assert!(fetch.await.unwrap().is_ok());
}
