//! Subscription Registry
//!
//! Reference-counted, deduplicated upstream subscriptions per symbol.
//!
//! The registry wraps the pure [`SubscriptionBook`] with the side effects it
//! asks for: subscribe and forget requests through the correlator, waiters
//! for callers blocked on an acknowledgment, and delivery of accepted ticks
//! to the registered [`TickSink`]s.
//!
//! Completions run in spawned tasks, so dropping a caller's future never
//! strands a subscription. The state lock is never held across an `.await`.
//!
//! # Lifecycle
//!
//! ```text
//!             first subscribe            ack               last unsubscribe
//!  (absent) ─────────────────► Pending ───────► Active ─────────────────────► Closing ──► (absent)
//!                                 ▲                │                            │
//!                                 └── connection ──┘         re-acquired ───────┘──► Pending
//!                                      lost
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::application::ports::{
    ConnectionError, ConnectionEvent, ConnectionState, StreamListener, TickSink, TickUpdate,
};
use crate::domain::market::{Symbol, Tick};
use crate::domain::subscription::{
    Ack, Acquire, Close, Failure, Generation, Release, SubscriptionBook, SubscriptionState,
    SubscriptionStats, TickVerdict,
};
use crate::infrastructure::config::FeedSettings;
use crate::infrastructure::deriv::{Correlator, Request, RequestError, Response, Transport};
use crate::infrastructure::metrics;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Candle width in seconds.
    pub granularity: u32,
    /// Candles requested with each subscription.
    pub history_count: usize,
    /// Time to wait for an unsubscribe before discarding the subscription.
    pub unsubscribe_grace: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            granularity: 60,
            history_count: 300,
            unsubscribe_grace: Duration::from_secs(5),
        }
    }
}

impl RegistrySettings {
    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_settings(settings: &FeedSettings) -> Self {
        Self {
            granularity: settings.chart.granularity,
            history_count: settings.chart.history_count,
            unsubscribe_grace: settings.requests.unsubscribe_grace,
        }
    }
}

/// A subscribe call did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The transport could not be established.
    #[error("cannot connect: {0}")]
    Connection(#[from] ConnectionError),

    /// The upstream subscribe request failed.
    #[error("subscribe request failed: {0}")]
    Request(#[from] RequestError),

    /// Every reference was released before the acknowledgment.
    #[error("released before acknowledgment")]
    Released,

    /// Reconnection gave up; the subscription resumes after a reconnect.
    #[error("connection failed while subscribing")]
    ConnectionFailed,

    /// The registry was shut down.
    #[error("subscription registry closed")]
    Closed,
}

impl SubscribeError {
    /// Whether the caller still holds its reference after this error.
    #[must_use]
    pub const fn reference_retained(&self) -> bool {
        matches!(self, Self::ConnectionFailed)
    }
}

/// Result of an unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Nothing was held.
    Noop,
    /// Other consumers still hold the subscription.
    Retained {
        /// References left.
        ref_count: usize,
    },
    /// The upstream subscription is closed.
    Closed,
}

type Waiter = oneshot::Sender<Result<(), SubscribeError>>;

#[derive(Default)]
struct RegistryState {
    book: SubscriptionBook,
    waiters: HashMap<Symbol, Vec<Waiter>>,
    closers: HashMap<Symbol, Vec<oneshot::Sender<()>>>,
}

impl RegistryState {
    fn resolve_waiters(&mut self, symbol: &str, result: &Result<(), SubscribeError>) {
        for waiter in self.waiters.remove(symbol).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_all_waiters(&mut self, error: &SubscribeError) {
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Wake unsubscribers whose release is settled: the entry is gone or
    /// was re-acquired.
    fn settle_closers(&mut self) {
        let book = &self.book;
        self.closers.retain(|symbol, closers| {
            let open = book.get(symbol).is_some_and(|entry| entry.ref_count() == 0);
            if !open {
                for closer in closers.drain(..) {
                    let _ = closer.send(());
                }
            }
            open
        });
    }

    fn register_closer(&mut self, symbol: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.closers.entry(symbol.to_string()).or_default().push(tx);
        rx
    }
}

/// Session-scoped subscription registry.
pub struct SubscriptionRegistry {
    me: Weak<Self>,
    correlator: Arc<Correlator>,
    transport: Arc<Transport>,
    settings: RegistrySettings,
    state: Mutex<RegistryState>,
    sinks: RwLock<Vec<Weak<dyn TickSink>>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry issuing through `correlator`.
    #[must_use]
    pub fn new(
        correlator: Arc<Correlator>,
        transport: Arc<Transport>,
        settings: RegistrySettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            correlator,
            transport,
            settings,
            state: Mutex::new(RegistryState::default()),
            sinks: RwLock::new(Vec::new()),
        })
    }

    /// Register a receiver of accepted ticks (held weakly).
    pub fn add_sink(&self, sink: &Arc<dyn TickSink>) {
        self.sinks.write().push(Arc::downgrade(sink));
    }

    // =========================================================================
    // Consumer API
    // =========================================================================

    /// Take a reference on `symbol`, subscribing upstream on the first one.
    ///
    /// Resolves once the upstream subscription is active. Concurrent callers
    /// share one upstream request and observe the same outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be established or the
    /// upstream subscription fails. See [`SubscribeError::reference_retained`]
    /// for whether the reference survives the error.
    pub async fn subscribe(&self, symbol: &str) -> Result<(), SubscribeError> {
        self.transport.ensure_connected().await?;

        let rx = {
            let mut state = self.state.lock();
            let outcome = state.book.acquire(symbol);
            tracing::debug!(symbol, ?outcome, "Subscription reference acquired");

            if outcome == (Acquire::Joined { active: true }) {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.entry(symbol.to_string()).or_default().push(tx);
            if let Acquire::Subscribe { generation } = outcome {
                self.issue_subscribe(&mut state, symbol, generation);
            }
            publish_stats(&state);
            rx
        };

        rx.await.unwrap_or(Err(SubscribeError::Closed))
    }

    /// Drop a reference on `symbol`, closing upstream on the last one.
    ///
    /// Resolves once the upstream close completed or its grace timeout
    /// elapsed. A subscription still waiting for its acknowledgment is
    /// discarded right away when no connection is up, and after the grace
    /// timeout otherwise. Unknown symbols are a no-op.
    pub async fn unsubscribe(&self, symbol: &str) -> ReleaseOutcome {
        let rx = {
            let mut state = self.state.lock();
            let outcome = state.book.release(symbol);
            tracing::debug!(symbol, ?outcome, "Subscription reference released");

            let rx = match outcome {
                Release::Noop => return ReleaseOutcome::Noop,
                Release::Retained { remaining } if remaining > 0 => {
                    return ReleaseOutcome::Retained {
                        ref_count: remaining,
                    };
                }
                Release::Deferred if !self.transport.state().is_connected() => {
                    tracing::info!(symbol, "Released while disconnected, discarding");
                    discard_released(&mut state, symbol);
                    publish_stats(&state);
                    return ReleaseOutcome::Closed;
                }
                Release::Retained { .. } | Release::Deferred => state.register_closer(symbol),
                Release::Unsubscribe { handle, generation } => {
                    let rx = state.register_closer(symbol);
                    self.issue_forget(&mut state, symbol, handle, generation);
                    rx
                }
            };
            publish_stats(&state);
            rx
        };

        if tokio::time::timeout(self.settings.unsubscribe_grace, rx)
            .await
            .is_err()
        {
            let mut state = self.state.lock();
            if discard_released(&mut state, symbol) {
                tracing::warn!(symbol, "Acknowledgment not received within grace, discarding");
            }
            state.settle_closers();
            publish_stats(&state);
        }
        ReleaseOutcome::Closed
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.state.lock().book.stats()
    }

    /// Lifecycle state of a symbol.
    #[must_use]
    pub fn state_of(&self, symbol: &str) -> Option<SubscriptionState> {
        self.state.lock().book.state_of(symbol)
    }

    /// Reference count of a symbol (0 when unknown).
    #[must_use]
    pub fn ref_count(&self, symbol: &str) -> usize {
        self.state.lock().book.ref_count(symbol)
    }

    // =========================================================================
    // Upstream Operations
    // =========================================================================

    fn issue_subscribe(&self, state: &mut RegistryState, symbol: &str, generation: Generation) {
        let request = Request::SubscribeCandles {
            symbol: symbol.to_string(),
            granularity: self.settings.granularity,
            count: self.settings.history_count,
        };

        match self.correlator.start(&request) {
            Ok(pending) => {
                let epoch = pending.epoch();
                state.book.mark_sent(symbol, generation, epoch);
                tracing::info!(symbol, generation, epoch, "Subscribing upstream");

                let Some(this) = self.me.upgrade() else {
                    return;
                };
                let symbol = symbol.to_string();
                tokio::spawn(async move {
                    let result = this.correlator.wait(pending).await;
                    this.complete_subscribe(&symbol, generation, epoch, result);
                });
            }
            Err(e) => self.fail_subscribe(state, symbol, generation, e),
        }
    }

    fn complete_subscribe(
        &self,
        symbol: &str,
        generation: Generation,
        epoch: u64,
        result: Result<Response, RequestError>,
    ) {
        let mut state = self.state.lock();

        let (ticks, handle) = match result {
            Ok(Response::Candles {
                ticks,
                subscription_id: Some(handle),
            }) => (ticks, handle),
            Ok(other) => {
                let error = RequestError::UnexpectedResponse(format!("{other:?}"));
                self.fail_subscribe(&mut state, symbol, generation, error);
                return;
            }
            Err(e) => {
                self.fail_subscribe(&mut state, symbol, generation, e);
                return;
            }
        };

        let seed_epoch = ticks.last().map(|t| t.epoch);
        match state
            .book
            .on_subscribe_ack(symbol, generation, handle.clone(), seed_epoch)
        {
            Ack::Activated => {
                tracing::info!(symbol, seed = ticks.len(), "Subscription active");
                self.deliver(symbol, TickUpdate::Seed(ticks));
                state.resolve_waiters(symbol, &Ok(()));
            }
            Ack::Release { generation } => {
                tracing::info!(symbol, "Released before acknowledgment, closing");
                state.resolve_waiters(symbol, &Err(SubscribeError::Released));
                self.issue_forget(&mut state, symbol, handle, generation);
            }
            Ack::Stale => {
                tracing::debug!(symbol, generation, "Stale subscribe acknowledgment");
                if epoch == self.transport.connection_epoch() {
                    self.forget_orphan(handle);
                }
            }
        }
        publish_stats(&state);
    }

    fn fail_subscribe(
        &self,
        state: &mut RegistryState,
        symbol: &str,
        generation: Generation,
        error: RequestError,
    ) {
        let retryable = retries_after(&error, self.transport.state());

        match state.book.on_subscribe_failed(symbol, generation, retryable) {
            Failure::Removed => {
                tracing::warn!(symbol, error = %error, "Subscribe failed");
                state.resolve_waiters(symbol, &Err(SubscribeError::Request(error)));
                state.settle_closers();
            }
            Failure::AwaitingReconnect => {
                tracing::debug!(symbol, error = %error, "Subscribe deferred until reconnection");
            }
            Failure::Stale => {
                tracing::debug!(symbol, generation, "Stale subscribe failure");
            }
        }
        publish_stats(state);
    }

    fn issue_forget(
        &self,
        state: &mut RegistryState,
        symbol: &str,
        handle: String,
        generation: Generation,
    ) {
        let request = Request::Forget {
            subscription_id: handle,
        };

        match self.correlator.start(&request) {
            Ok(pending) => {
                state.book.mark_sent(symbol, generation, pending.epoch());
                tracing::info!(symbol, generation, "Unsubscribing upstream");

                let Some(this) = self.me.upgrade() else {
                    return;
                };
                let symbol = symbol.to_string();
                let grace = self.settings.unsubscribe_grace;
                tokio::spawn(async move {
                    match tokio::time::timeout(grace, this.correlator.wait(pending)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(symbol = %symbol, error = %e, "Unsubscribe failed");
                        }
                        Err(_) => {
                            tracing::warn!(symbol = %symbol, "Unsubscribe grace elapsed");
                        }
                    }
                    let mut state = this.state.lock();
                    this.finish_close(&mut state, &symbol, generation);
                });
            }
            Err(e) => {
                tracing::debug!(symbol, error = %e, "Unsubscribe not sent, discarding");
                self.finish_close(state, symbol, generation);
            }
        }
    }

    fn finish_close(&self, state: &mut RegistryState, symbol: &str, generation: Generation) {
        match state.book.on_close_done(symbol, generation) {
            Close::Removed => tracing::info!(symbol, "Subscription closed"),
            Close::Resubscribe { generation } => {
                tracing::info!(symbol, "Re-acquired while closing, resubscribing");
                self.issue_subscribe(state, symbol, generation);
            }
            Close::Stale => {}
        }
        state.settle_closers();
        publish_stats(state);
    }

    /// Forget an upstream stream nobody tracks any more.
    fn forget_orphan(&self, handle: String) {
        let request = Request::Forget {
            subscription_id: handle,
        };
        let Ok(pending) = self.correlator.start(&request) else {
            return;
        };
        let Some(this) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let _ = this.correlator.wait(pending).await;
        });
    }

    fn deliver(&self, symbol: &str, update: TickUpdate) {
        let sinks: Vec<Arc<dyn TickSink>> =
            self.sinks.read().iter().filter_map(Weak::upgrade).collect();
        for sink in sinks {
            sink.on_ticks(symbol, update.clone());
        }
    }
}

/// Whether a failed subscribe stays pending for the next connection.
///
/// Connection failures are retried unless the transport was closed, in which
/// case nothing will re-issue the request.
const fn retries_after(error: &RequestError, transport: ConnectionState) -> bool {
    error.is_connection_failure() && !matches!(transport, ConnectionState::Disconnected)
}

/// Discard `symbol` if its subscribe is pending without consumers, failing
/// anyone still waiting on it.
fn discard_released(state: &mut RegistryState, symbol: &str) -> bool {
    let discarded = state.book.discard_released(symbol);
    if discarded {
        state.resolve_waiters(symbol, &Err(SubscribeError::Released));
        state.settle_closers();
    }
    discarded
}

fn publish_stats(state: &RegistryState) {
    metrics::set_upstream_subscriptions(state.book.stats().symbol_count);
}

impl StreamListener for SubscriptionRegistry {
    fn on_stream_tick(&self, symbol: &str, subscription_id: Option<&str>, tick: Tick) {
        let mut state = self.state.lock();

        let foreign = match (
            subscription_id,
            state.book.get(symbol).and_then(|entry| entry.upstream_handle()),
        ) {
            (Some(received), Some(expected)) => received != expected,
            _ => false,
        };
        if foreign {
            metrics::record_tick_dropped("foreign_stream");
            tracing::trace!(symbol, epoch = tick.epoch, "Dropping tick from foreign stream");
            return;
        }

        match state.book.accept_tick(symbol, tick.epoch) {
            TickVerdict::Accepted => {
                metrics::record_tick_ingested();
                self.deliver(symbol, TickUpdate::Live(tick));
            }
            verdict => {
                metrics::record_tick_dropped(verdict.as_str());
                tracing::trace!(
                    symbol,
                    epoch = tick.epoch,
                    reason = verdict.as_str(),
                    "Dropping tick"
                );
            }
        }
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        let mut state = self.state.lock();

        match event {
            ConnectionEvent::Connected { epoch } => {
                let (reissue, removed) = state.book.on_connected(*epoch);
                for symbol in &removed {
                    state.resolve_waiters(symbol, &Err(SubscribeError::Released));
                }
                if !reissue.is_empty() {
                    tracing::info!(count = reissue.len(), epoch, "Re-issuing subscriptions");
                }
                for item in reissue {
                    self.issue_subscribe(&mut state, &item.symbol, item.generation);
                }
            }
            ConnectionEvent::Lost {
                reconnecting: true, ..
            } => {
                let removed = state.book.on_connection_lost();
                for symbol in &removed {
                    state.resolve_waiters(symbol, &Err(SubscribeError::Released));
                }
                let stats = state.book.stats();
                tracing::info!(
                    pending = stats.pending,
                    discarded = removed.len(),
                    "Subscriptions await reconnection"
                );
            }
            ConnectionEvent::Lost {
                reconnecting: false,
                ..
            } => {
                state.book.clear();
                state.resolve_all_waiters(&SubscribeError::Request(RequestError::ConnectionLost));
            }
            ConnectionEvent::Failed { reason } => {
                for symbol in state.book.discard_all_released() {
                    state.resolve_waiters(&symbol, &Err(SubscribeError::Released));
                }
                tracing::warn!(%reason, "Subscriptions suspended until reconnect");
                state.resolve_all_waiters(&SubscribeError::ConnectionFailed);
            }
            ConnectionEvent::Closed => {
                let dropped = state.book.clear();
                if !dropped.is_empty() {
                    tracing::info!(count = dropped.len(), "Subscriptions dropped on close");
                }
                state.resolve_all_waiters(&SubscribeError::Closed);
            }
        }

        state.settle_closers();
        publish_stats(&state);
    }

    fn has_live_interest(&self) -> bool {
        self.state.lock().book.has_live_interest()
    }
}
