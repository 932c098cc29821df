//! Upstream Transport
//!
//! Owns the single upstream socket of a session: establishes it through a
//! [`Connector`], writes outbound frames from a bounded queue, hands every
//! inbound frame to one [`FrameHandler`] in arrival order, keeps the socket
//! alive, and reconnects with bounded backoff after an unexpected closure.
//!
//! # Connection Flow
//!
//! ```text
//! connect() ──► Connecting ──► Connected ──(drop)──► Reconnecting ──► Connected
//!                   │                                     │
//!                   ▼                                     ▼
//!             Disconnected                             Failed
//! ```
//!
//! Every established socket gets a fresh connection epoch. `send` reports
//! the epoch its frame was queued on so callers can tell which connection
//! a request belongs to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Connection, ConnectionError, ConnectionEvent, ConnectionState, Connector, FrameHandler,
};
use crate::infrastructure::config::FeedSettings;
use crate::infrastructure::deriv::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState,
};
use crate::infrastructure::deriv::messages::PING_FRAME;
use crate::infrastructure::deriv::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::metrics;

/// A frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// No socket is open.
    #[error("transport not connected")]
    NotConnected,
    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upstream WebSocket URL.
    pub url: String,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Keep-alive behavior.
    pub heartbeat: HeartbeatConfig,
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Create configuration for `url` with default policies.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            outbound_capacity: 256,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub fn from_settings(settings: &FeedSettings) -> Self {
        Self {
            url: settings.endpoint.ws_url(),
            reconnect: ReconnectConfig::from_connection_settings(&settings.connection),
            heartbeat: HeartbeatConfig::from_connection_settings(&settings.connection),
            outbound_capacity: settings.connection.outbound_queue_capacity,
            connect_timeout: settings.connection.connect_timeout,
        }
    }
}

/// Why a socket's read/write loop ended.
enum PumpEnd {
    Cancelled,
    Lost(String),
}

/// Session-scoped upstream socket with reconnection.
pub struct Transport {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    handler: RwLock<Option<Weak<dyn FrameHandler>>>,
    state_tx: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    session: Mutex<Option<CancellationToken>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("epoch", &self.connection_epoch())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a disconnected transport.
    #[must_use]
    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            handler: RwLock::new(None),
            state_tx,
            epoch: AtomicU64::new(0),
            outbound: Mutex::new(None),
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register the single dispatch point for inbound frames.
    ///
    /// The transport holds the handler weakly.
    pub fn on_message(&self, handler: &Arc<dyn FrameHandler>) {
        *self.handler.write() = Some(Arc::downgrade(handler));
    }

    /// Upstream endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Epoch of the most recent connection (0 before the first one).
    #[must_use]
    pub fn connection_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Connect / Disconnect
    // =========================================================================

    /// Establish the socket.
    ///
    /// Returns immediately when already connected and waits for an ongoing
    /// reconnection to settle.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or reconnection gives up.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let _guard = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Reconnecting => return self.wait_settled().await,
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Failed => {}
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self.session.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "Connecting to upstream");

        let connection = tokio::select! {
            () = cancel.cancelled() => {
                return Err(ConnectionError::Failed("disconnected while connecting".to_string()));
            }
            result = self.open_connection() => result,
        };

        match connection {
            Ok(connection) => {
                let Some((outbound_rx, epoch)) = self.activate(&cancel) else {
                    return Err(ConnectionError::Failed("disconnected while connecting".to_string()));
                };
                tracing::info!(epoch, "Upstream connected");
                self.emit(&ConnectionEvent::Connected { epoch });
                tokio::spawn(Arc::clone(self).supervise(connection, outbound_rx, cancel));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Upstream connection failed");
                self.transition(&cancel, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Connect unless already connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be established.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.state().is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    /// Close the socket and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        let changed = {
            let mut session = self.session.lock();
            let token = session.take();
            if let Some(token) = &token {
                token.cancel();
            }
            *self.outbound.lock() = None;
            let previous = self.state_tx.send_replace(ConnectionState::Disconnected);
            token.is_some() || previous != ConnectionState::Disconnected
        };

        if changed {
            metrics::set_connection_state(ConnectionState::Disconnected);
            tracing::info!("Upstream disconnected");
            self.emit(&ConnectionEvent::Closed);
        }
    }

    /// Queue a frame for the writer.
    ///
    /// Returns the epoch of the connection the frame was queued on.
    ///
    /// # Errors
    ///
    /// Returns an error if no socket is open or the queue is full.
    pub fn send(&self, frame: String) -> Result<u64, SendError> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(SendError::NotConnected);
        };

        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })?;
        Ok(self.epoch.load(Ordering::SeqCst))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn open_connection(&self) -> Result<Connection, ConnectionError> {
        tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config.url),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)?
    }

    async fn wait_settled(&self) -> Result<(), ConnectionError> {
        let mut rx = self.state_tx.subscribe();
        let settled = rx
            .wait_for(|state| !state.is_transitional())
            .await
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected);

        if settled.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::Failed(format!(
                "reconnection ended {}",
                settled.as_str()
            )))
        }
    }

    /// Install a fresh outbound queue and publish `Connected`.
    ///
    /// Returns `None` when the session was cancelled meanwhile.
    fn activate(&self, cancel: &CancellationToken) -> Option<(mpsc::Receiver<String>, u64)> {
        let session = self.session.lock();
        if cancel.is_cancelled() {
            return None;
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let epoch = {
            let mut outbound = self.outbound.lock();
            *outbound = Some(tx);
            self.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.state_tx.send_replace(ConnectionState::Connected);
        drop(session);

        metrics::set_connection_state(ConnectionState::Connected);
        Some((rx, epoch))
    }

    /// Change state unless the session was cancelled.
    fn transition(&self, cancel: &CancellationToken, state: ConnectionState) -> bool {
        let _session = self.session.lock();
        if cancel.is_cancelled() {
            return false;
        }
        if state != ConnectionState::Connected {
            *self.outbound.lock() = None;
        }
        self.state_tx.send_replace(state);
        metrics::set_connection_state(state);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        metrics::set_connection_state(state);
    }

    fn handler(&self) -> Option<Arc<dyn FrameHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: &ConnectionEvent) {
        if let Some(handler) = self.handler() {
            handler.on_connection_event(event);
        }
    }

    fn wants_reconnect(&self) -> bool {
        self.handler().is_some_and(|handler| handler.wants_reconnect())
    }

    /// Drive one session: pump the socket, then reconnect until cancelled,
    /// out of budget, or no longer wanted.
    async fn supervise(
        self: Arc<Self>,
        mut connection: Connection,
        mut outbound_rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let reason = match self.pump(connection, outbound_rx, &cancel).await {
                PumpEnd::Cancelled => return,
                PumpEnd::Lost(reason) => reason,
            };

            let reconnect = self.wants_reconnect();
            let next_state = if reconnect {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
            if !self.transition(&cancel, next_state) {
                return;
            }

            tracing::warn!(%reason, reconnect, "Upstream connection lost");
            self.emit(&ConnectionEvent::Lost {
                reason,
                reconnecting: reconnect,
            });

            if !reconnect {
                return;
            }

            let Some(next) = self.reconnect(&mut policy, &cancel).await else {
                return;
            };
            policy.reset();

            let Some((rx, epoch)) = self.activate(&cancel) else {
                return;
            };
            tracing::info!(epoch, "Upstream reconnected");
            self.emit(&ConnectionEvent::Connected { epoch });

            connection = next;
            outbound_rx = rx;
        }
    }

    async fn reconnect(
        &self,
        policy: &mut ReconnectPolicy,
        cancel: &CancellationToken,
    ) -> Option<Connection> {
        let mut last_error = String::from("connection lost");

        loop {
            let Some(delay) = policy.next_delay() else {
                tracing::error!(
                    attempts = policy.attempt_count(),
                    error = %last_error,
                    "Reconnect budget exhausted"
                );
                if self.transition(cancel, ConnectionState::Failed) {
                    self.emit(&ConnectionEvent::Failed { reason: last_error });
                }
                return None;
            };

            tracing::info!(
                attempt = policy.attempt_count(),
                max_attempts = policy.max_attempts(),
                delay_ms = delay.as_millis(),
                "Reconnecting to upstream"
            );

            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            metrics::record_reconnect();
            let result = tokio::select! {
                () = cancel.cancelled() => return None,
                result = self.open_connection() => result,
            };

            match result {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }
    }

    /// Read and write one socket until it ends.
    async fn pump(
        &self,
        connection: Connection,
        mut outbound_rx: mpsc::Receiver<String>,
        cancel: &CancellationToken,
    ) -> PumpEnd {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let heartbeat = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        let heartbeat_cancel = cancel.child_token();
        tokio::spawn(
            HeartbeatMonitor::new(
                self.config.heartbeat.clone(),
                Arc::clone(&heartbeat),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let end = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let _ = sink.close().await;
                    break PumpEnd::Cancelled;
                }

                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => {
                        heartbeat.record_inbound();
                        metrics::record_frame_received();
                        if let Some(handler) = self.handler() {
                            handler.on_frame(&text);
                        }
                    }
                    Some(Err(e)) => break PumpEnd::Lost(e.to_string()),
                    None => break PumpEnd::Lost("closed by upstream".to_string()),
                },

                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        break PumpEnd::Lost(format!("write failed: {e}"));
                    }
                }

                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendPing => {
                        if let Err(e) = sink.send(PING_FRAME.to_string()).await {
                            break PumpEnd::Lost(format!("write failed: {e}"));
                        }
                        heartbeat.mark_ping_sent();
                    }
                    HeartbeatEvent::Timeout => break PumpEnd::Lost("keep-alive timeout".to_string()),
                },
            }
        };

        heartbeat_cancel.cancel();
        end
    }
}
