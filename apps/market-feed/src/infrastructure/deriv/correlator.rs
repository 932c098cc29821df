//! Request/Response Correlator
//!
//! Issues requests with fresh integer ids, matches responses by the echoed
//! `req_id`, and routes streamed data frames to the stream listener by
//! symbol. Every request resolves exactly once: with its response, with
//! the upstream error, on timeout, or when the connection drops.
//!
//! The correlator is the transport's single [`FrameHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::application::ports::{ConnectionEvent, FrameHandler, StreamListener};
use crate::domain::market::{Instrument, Symbol, Tick};
use crate::infrastructure::deriv::codec::JsonCodec;
use crate::infrastructure::deriv::messages::{InboundBody, Request, RequestId, RequestKind};
use crate::infrastructure::deriv::transport::{SendError, Transport};
use crate::infrastructure::metrics;

/// Default time a request may stay unanswered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A correlated request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The frame could not be queued.
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    /// No response within the request timeout.
    #[error("{} request timed out", kind.as_str())]
    Timeout {
        /// Kind of the timed-out request.
        kind: RequestKind,
    },

    /// The upstream rejected the request.
    #[error("upstream error {code}: {message}")]
    Upstream {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The connection dropped before a response arrived.
    #[error("connection lost before response")]
    ConnectionLost,

    /// The response did not match the request kind.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The request could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl RequestError {
    /// Whether the failure was caused by the connection rather than the
    /// request itself.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::Send(SendError::NotConnected)
        )
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// History batch, with the stream handle when subscribing.
    Candles {
        /// Candles, oldest first.
        ticks: Vec<Tick>,
        /// Upstream subscription id.
        subscription_id: Option<String>,
    },
    /// Stream cancellation result.
    Forgotten(bool),
    /// Instrument catalog.
    ActiveSymbols(Vec<Instrument>),
}

type Reply = oneshot::Sender<Result<Response, RequestError>>;

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    symbol: Option<Symbol>,
    created_at: Instant,
    reply: Reply,
}

/// Handle to a request that has been sent but not yet resolved.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    epoch: u64,
    kind: RequestKind,
    rx: oneshot::Receiver<Result<Response, RequestError>>,
}

impl PendingResponse {
    /// Request id.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Epoch of the connection the request was sent on.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Request kind.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }
}

/// Removes a pending entry when the waiting future is dropped.
struct Deregister<'a> {
    correlator: &'a Correlator,
    id: RequestId,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        self.correlator.pending.lock().remove(&self.id);
    }
}

/// Request/response matcher for one transport.
pub struct Correlator {
    transport: Arc<Transport>,
    codec: JsonCodec,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    timeout: Duration,
    listener: RwLock<Option<Weak<dyn StreamListener>>>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Correlator {
    /// Create a correlator issuing over `transport`.
    #[must_use]
    pub fn new(transport: Arc<Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            codec: JsonCodec::new(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
            listener: RwLock::new(None),
        }
    }

    /// Register the receiver of streamed data frames (held weakly).
    pub fn set_stream_listener(&self, listener: &Arc<dyn StreamListener>) {
        *self.listener.write() = Some(Arc::downgrade(listener));
    }

    /// Number of unresolved requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocate an id, record the request, and send it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encoded or queued; nothing
    /// stays recorded in that case.
    pub fn start(&self, request: &Request) -> Result<PendingResponse, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let kind = request.kind();
        let frame = self
            .codec
            .encode_request(request, id)
            .map_err(|e| RequestError::Encode(e.to_string()))?;

        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                kind,
                symbol: request.symbol().map(str::to_string),
                created_at: Instant::now(),
                reply,
            },
        );

        match self.transport.send(frame) {
            Ok(epoch) => {
                metrics::record_request(kind);
                tracing::debug!(req_id = id, kind = kind.as_str(), epoch, "Request sent");
                Ok(PendingResponse {
                    id,
                    epoch,
                    kind,
                    rx,
                })
            }
            Err(e) => {
                self.pending.lock().remove(&id);
                Err(RequestError::Send(e))
            }
        }
    }

    /// Wait for a started request to resolve.
    ///
    /// # Errors
    ///
    /// Returns the upstream error, `Timeout`, or `ConnectionLost`.
    pub async fn wait(&self, pending: PendingResponse) -> Result<Response, RequestError> {
        let PendingResponse { id, kind, rx, .. } = pending;
        let _deregister = Deregister {
            correlator: self,
            id,
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                metrics::record_request_timeout(kind);
                tracing::warn!(req_id = id, kind = kind.as_str(), "Request timed out");
                Err(RequestError::Timeout { kind })
            }
        }
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or does not resolve
    /// successfully.
    pub async fn issue(&self, request: &Request) -> Result<Response, RequestError> {
        let pending = self.start(request)?;
        self.wait(pending).await
    }

    fn resolve(&self, id: RequestId, result: Result<Response, RequestError>) {
        let Some(pending) = self.pending.lock().remove(&id) else {
            tracing::debug!(req_id = id, "Dropping response for unknown request");
            return;
        };

        metrics::record_request_duration(pending.kind, pending.created_at.elapsed());
        if let Err(e) = &result {
            tracing::debug!(
                req_id = id,
                kind = pending.kind.as_str(),
                symbol = pending.symbol.as_deref().unwrap_or_default(),
                error = %e,
                "Request failed"
            );
        }
        let _ = pending.reply.send(result);
    }

    fn fail_all(&self, error: &RequestError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), error = %error, "Failing outstanding requests");
        }
        for pending in drained {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    fn listener(&self) -> Option<Arc<dyn StreamListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }
}

impl FrameHandler for Correlator {
    fn on_frame(&self, text: &str) {
        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_malformed_frame();
                tracing::warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        let response = match frame.body {
            InboundBody::Stream { symbol, tick } => {
                if let Some(listener) = self.listener() {
                    listener.on_stream_tick(&symbol, frame.subscription_id.as_deref(), tick);
                }
                return;
            }
            InboundBody::Pong => {
                tracing::trace!("Keep-alive acknowledged");
                return;
            }
            InboundBody::Error(error) => Err(RequestError::Upstream {
                code: error.code,
                message: error.message,
            }),
            InboundBody::Candles(ticks) => Ok(Response::Candles {
                ticks,
                subscription_id: frame.subscription_id,
            }),
            InboundBody::Forgotten(done) => Ok(Response::Forgotten(done)),
            InboundBody::ActiveSymbols(list) => Ok(Response::ActiveSymbols(list)),
        };

        match frame.req_id {
            Some(id) => self.resolve(id, response),
            None => tracing::debug!("Dropping uncorrelated response"),
        }
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { .. } => {}
            ConnectionEvent::Lost { .. }
            | ConnectionEvent::Failed { .. }
            | ConnectionEvent::Closed => self.fail_all(&RequestError::ConnectionLost),
        }

        if let Some(listener) = self.listener() {
            listener.on_connection_event(event);
        }
    }

    fn wants_reconnect(&self) -> bool {
        self.listener()
            .is_some_and(|listener| listener.has_live_interest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{Connection, ConnectionError, LinkError, MockConnector};
    use crate::infrastructure::deriv::transport::TransportConfig;
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};

    struct Harness {
        correlator: Arc<Correlator>,
        written: fmpsc::UnboundedReceiver<String>,
        _inbound: fmpsc::UnboundedSender<Result<String, LinkError>>,
    }

    impl Harness {
        async fn next_request(&mut self) -> serde_json::Value {
            let text = self.written.next().await.unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    async fn harness(timeout: Duration) -> Harness {
        let (out_tx, written) = fmpsc::unbounded::<String>();
        let (inbound, in_rx) = fmpsc::unbounded::<Result<String, LinkError>>();
        let connection = Connection::new(
            Box::pin(out_tx.sink_map_err(|e| LinkError(e.to_string()))),
            Box::pin(in_rx),
        );
        let slot = Mutex::new(Some(connection));
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(move |_| slot.lock().take().ok_or(ConnectionError::Timeout));

        let transport = Arc::new(Transport::new(
            TransportConfig::new("wss://test.invalid"),
            Arc::new(connector),
        ));
        let correlator = Arc::new(Correlator::new(Arc::clone(&transport), timeout));
        let handler: Arc<dyn FrameHandler> = correlator.clone();
        transport.on_message(&handler);
        transport.connect().await.unwrap();

        Harness {
            correlator,
            written,
            _inbound: inbound,
        }
    }

    #[tokio::test]
    async fn response_resolves_matching_request() {
        let mut h = harness(DEFAULT_REQUEST_TIMEOUT).await;

        let pending = h.correlator.start(&Request::ActiveSymbols).unwrap();
        let sent = h.next_request().await;
        assert_eq!(sent["req_id"], pending.id());

        h.correlator.on_frame(&format!(
            r#"{{"msg_type":"active_symbols","req_id":{},"active_symbols":[]}}"#,
            pending.id()
        ));

        assert_eq!(
            h.correlator.wait(pending).await,
            Ok(Response::ActiveSymbols(vec![]))
        );
        assert_eq!(h.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let h = harness(DEFAULT_REQUEST_TIMEOUT).await;

        let a = h.correlator.start(&Request::ActiveSymbols).unwrap();
        let b = h.correlator.start(&Request::ActiveSymbols).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(h.correlator.pending_count(), 2);
    }

    #[tokio::test]
    async fn upstream_error_resolves_only_its_request() {
        let h = harness(DEFAULT_REQUEST_TIMEOUT).await;
        let failing = h.correlator.start(&Request::ActiveSymbols).unwrap();
        let other = h.correlator.start(&Request::ActiveSymbols).unwrap();

        h.correlator.on_frame(&format!(
            r#"{{"error":{{"code":"RateLimit","message":"slow down"}},"msg_type":"active_symbols","req_id":{}}}"#,
            failing.id()
        ));

        assert_eq!(
            h.correlator.wait(failing).await,
            Err(RequestError::Upstream {
                code: "RateLimit".to_string(),
                message: "slow down".to_string(),
            })
        );
        assert_eq!(h.correlator.pending_count(), 1);
        drop(other);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_only_timed_out_request() {
        let h = harness(Duration::from_secs(10)).await;
        let slow = h.correlator.start(&Request::ActiveSymbols).unwrap();
        let fast = h.correlator.start(&Request::ActiveSymbols).unwrap();
        let fast_id = fast.id();

        let correlator = Arc::clone(&h.correlator);
        let slow_wait = tokio::spawn(async move { correlator.wait(slow).await });
        tokio::time::advance(Duration::from_secs(5)).await;

        h.correlator.on_frame(&format!(
            r#"{{"msg_type":"forget","forget":1,"req_id":{fast_id}}}"#
        ));
        assert_eq!(
            h.correlator.wait(fast).await,
            Ok(Response::Forgotten(true))
        );

        assert_eq!(
            slow_wait.await.unwrap(),
            Err(RequestError::Timeout {
                kind: RequestKind::CatalogFetch
            })
        );
        assert_eq!(h.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let h = harness(DEFAULT_REQUEST_TIMEOUT).await;
        let pending = h.correlator.start(&Request::ActiveSymbols).unwrap();
        let id = pending.id();
        drop(pending);

        h.correlator.on_frame(&format!(
            r#"{{"msg_type":"active_symbols","req_id":{id},"active_symbols":[]}}"#
        ));
        h.correlator.on_frame(&format!(
            r#"{{"msg_type":"active_symbols","req_id":{id},"active_symbols":[]}}"#
        ));

        assert_eq!(h.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn connection_loss_fails_outstanding_requests() {
        let h = harness(DEFAULT_REQUEST_TIMEOUT).await;
        let pending = h.correlator.start(&Request::ActiveSymbols).unwrap();

        let mut wait = tokio_test::task::spawn(h.correlator.wait(pending));
        tokio_test::assert_pending!(wait.poll());

        h.correlator.on_connection_event(&ConnectionEvent::Lost {
            reason: "reset".to_string(),
            reconnecting: true,
        });

        assert!(wait.is_woken());
        tokio_test::assert_ready_eq!(wait.poll(), Err(RequestError::ConnectionLost));
    }

    #[tokio::test]
    async fn malformed_frame_does_not_disturb_pending() {
        let h = harness(DEFAULT_REQUEST_TIMEOUT).await;
        let pending = h.correlator.start(&Request::ActiveSymbols).unwrap();

        h.correlator.on_frame("{not json");
        h.correlator.on_frame(r#"{"msg_type":"mystery","req_id":1}"#);
        h.correlator.on_frame(&format!(
            r#"{{"msg_type":"active_symbols","req_id":{},"active_symbols":[]}}"#,
            pending.id()
        ));

        assert!(h.correlator.wait(pending).await.is_ok());
    }

    #[tokio::test]
    async fn send_failure_leaves_nothing_pending() {
        let h = harness(DEFAULT_REQUEST_TIMEOUT).await;
        h.correlator.transport.disconnect();

        let err = h.correlator.start(&Request::ActiveSymbols).unwrap_err();

        assert_eq!(err, RequestError::Send(SendError::NotConnected));
        assert!(err.is_connection_failure());
        assert_eq!(h.correlator.pending_count(), 0);
    }
}
