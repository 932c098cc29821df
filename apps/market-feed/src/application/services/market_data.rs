//! Market Data Store
//!
//! The facade a chart view binds to. It owns the selected symbol, the chart
//! type and the tick buffer, drives the registry on behalf of the view, and
//! publishes a [`StoreView`] snapshot after every observable change.
//!
//! # View Lifecycle
//!
//! ```text
//! Idle ──subscribe──► Subscribing ──ack──► Live ──unsubscribe──► Unsubscribing ──► Idle
//!   ▲                                                                               │
//!   └───────────────────────── symbol changed (from any phase) ◄────────────────────┘
//! ```
//!
//! Unsubscribing while still `Subscribing` marks the attempt released; the
//! subscription is closed as soon as the registry acknowledges it.
//!
//! Ticks for any symbol other than the selected one are ignored, so a late
//! delivery for a previous selection never reaches the buffer.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConnectionError, ConnectionState, TickSink, TickUpdate};
use crate::domain::market::{ChartPoint, ChartType, Symbol, Tick, project};
use crate::domain::tick_buffer::TickBuffer;
use crate::infrastructure::deriv::Transport;

use super::catalog::FetchError;
use super::history::HistoryClient;
use super::registry::{ReleaseOutcome, SubscribeError, SubscriptionRegistry};

/// Store configuration.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Ticks retained for the selected symbol.
    pub buffer_capacity: usize,
    /// Points returned by [`MarketDataStore::chart_series`].
    pub chart_window: usize,
    /// Candles requested by [`MarketDataStore::load_history`].
    pub history_count: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 300,
            chart_window: 300,
            history_count: 300,
        }
    }
}

/// Where the view stands with its selected symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ViewPhase {
    /// Nothing requested.
    #[default]
    Idle,
    /// Waiting for the upstream subscription.
    Subscribing,
    /// Receiving live ticks.
    Live,
    /// Waiting for the upstream close.
    Unsubscribing,
}

impl ViewPhase {
    /// Get the phase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Subscribing => "subscribing",
            Self::Live => "live",
            Self::Unsubscribing => "unsubscribing",
        }
    }
}

/// Published snapshot of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreView {
    /// Selected symbol.
    pub selected_symbol: Option<Symbol>,
    /// Chart rendering style.
    pub chart_type: ChartType,
    /// View lifecycle phase.
    pub phase: ViewPhase,
    /// Upstream connection state.
    pub connection: ConnectionState,
    /// Latest user-visible failure, cleared by the next successful action.
    pub notice: Option<String>,
    /// Ticks held in the buffer.
    pub tick_count: usize,
    /// Epoch of the newest tick.
    pub last_epoch: Option<i64>,
    /// Incremented with every publication.
    pub revision: u64,
}

/// A store operation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The operation needs a selected symbol.
    #[error("no symbol selected")]
    NoSymbolSelected,

    /// The selection changed while the operation was in flight.
    #[error("selected symbol changed")]
    SelectionChanged,

    /// Subscribing failed.
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    /// Fetching history failed.
    #[error(transparent)]
    History(#[from] FetchError),

    /// Reconnecting failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The subscribe task ended without settling.
    #[error("subscribe interrupted")]
    Interrupted,
}

/// How a subscribe attempt ended.
#[derive(Debug, Clone)]
struct Settled {
    subscribe: Result<(), StoreError>,
    /// Set when the acquired reference was handed back instead of adopted.
    release: Option<ReleaseOutcome>,
}

/// A subscribe attempt waiting for the registry.
#[derive(Debug)]
struct InFlight {
    attempt: u64,
    symbol: Symbol,
    release_requested: bool,
    settled: watch::Receiver<Option<Settled>>,
}

enum PendingRelease {
    Held(Symbol),
    InFlight(watch::Receiver<Option<Settled>>),
}

#[derive(Debug, Default)]
struct ViewModel {
    selected: Option<Symbol>,
    chart_type: ChartType,
    phase: ViewPhase,
    connection: ConnectionState,
    notice: Option<String>,
    /// Symbol on which the store holds a registry reference.
    held: Option<Symbol>,
    in_flight: Option<InFlight>,
    next_attempt: u64,
    revision: u64,
}

impl ViewModel {
    fn is_selected(&self, symbol: &str) -> bool {
        self.selected.as_deref() == Some(symbol)
    }
}

/// Observable market data facade.
pub struct MarketDataStore {
    me: Weak<Self>,
    registry: Arc<SubscriptionRegistry>,
    history: HistoryClient,
    transport: Arc<Transport>,
    settings: StoreSettings,
    buffer: TickBuffer,
    model: Mutex<ViewModel>,
    view_tx: watch::Sender<StoreView>,
}

impl std::fmt::Debug for MarketDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataStore")
            .field("view", &*self.view_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl MarketDataStore {
    /// Create a store.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        history: HistoryClient,
        transport: Arc<Transport>,
        settings: StoreSettings,
        chart_type: ChartType,
    ) -> Arc<Self> {
        let model = ViewModel {
            chart_type,
            connection: transport.state(),
            ..ViewModel::default()
        };
        let (view_tx, _) = watch::channel(StoreView {
            chart_type,
            connection: model.connection,
            ..StoreView::default()
        });

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry,
            history,
            transport,
            settings,
            buffer: TickBuffer::new(settings.buffer_capacity),
            model: Mutex::new(model),
            view_tx,
        })
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Current view snapshot.
    #[must_use]
    pub fn view(&self) -> StoreView {
        self.view_tx.borrow().clone()
    }

    /// Receiver of view snapshots.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<StoreView> {
        self.view_tx.subscribe()
    }

    /// View snapshots as a stream, starting with the current one.
    #[must_use]
    pub fn changes(&self) -> WatchStream<StoreView> {
        WatchStream::new(self.view_tx.subscribe())
    }

    /// Selected symbol.
    #[must_use]
    pub fn selected_symbol(&self) -> Option<Symbol> {
        self.model.lock().selected.clone()
    }

    /// Chart rendering style.
    #[must_use]
    pub fn chart_type(&self) -> ChartType {
        self.model.lock().chart_type
    }

    /// Buffered ticks of the selected symbol, oldest first.
    #[must_use]
    pub fn ticks(&self) -> Vec<Tick> {
        self.buffer.snapshot()
    }

    /// Newest buffered points in the shape of the current chart type.
    #[must_use]
    pub fn chart_series(&self) -> Vec<ChartPoint> {
        let chart_type = self.chart_type();
        project(&self.buffer.snapshot(), chart_type, self.settings.chart_window)
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Select the symbol to chart without subscribing.
    ///
    /// Changing the symbol clears the buffer, returns the view to idle and
    /// releases the reference held on the previous symbol.
    pub fn set_selected_symbol(&self, symbol: &str) {
        let released = {
            let mut model = self.model.lock();
            if model.is_selected(symbol) {
                return;
            }

            tracing::info!(
                symbol,
                previous = model.selected.as_deref().unwrap_or("-"),
                "Selected symbol changed"
            );
            model.selected = Some(symbol.to_string());
            model.phase = ViewPhase::Idle;
            model.notice = None;
            model.in_flight = None;
            self.buffer.clear();
            let released = model.held.take();
            self.publish(&mut model);
            released
        };

        if let Some(previous) = released {
            self.release_in_background(previous);
        }
    }

    /// Switch the chart rendering style. The buffer is left untouched.
    pub fn set_chart_type(&self, chart_type: ChartType) {
        let mut model = self.model.lock();
        if model.chart_type != chart_type {
            tracing::debug!(chart_type = chart_type.as_str(), "Chart type changed");
            model.chart_type = chart_type;
            self.publish(&mut model);
        }
    }

    /// Subscribe to live ticks of the selected symbol.
    ///
    /// Resolves once the upstream subscription is active. Calling it again
    /// while live is a no-op, and concurrent calls share one attempt. The
    /// attempt runs to completion even if this future is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if no symbol is selected, the selection changes or
    /// [`Self::unsubscribe_ticks`] is called before the subscription
    /// completes, or the registry fails to subscribe.
    pub async fn subscribe_ticks(self: &Arc<Self>) -> Result<(), StoreError> {
        let mut settled = {
            let mut model = self.model.lock();
            let Some(symbol) = model.selected.clone() else {
                return Err(StoreError::NoSymbolSelected);
            };
            if model.held.as_deref() == Some(symbol.as_str()) {
                return Ok(());
            }
            let joinable = model
                .in_flight
                .as_ref()
                .filter(|flight| flight.symbol == symbol && !flight.release_requested)
                .map(|flight| flight.settled.clone());
            match joinable {
                Some(settled) => {
                    tracing::debug!(symbol = %symbol, "Joining subscribe in flight");
                    settled
                }
                None => self.start_subscribe(&mut model, symbol),
            }
        };

        settled
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.as_ref().map(|s| s.subscribe.clone()))
            .unwrap_or(Err(StoreError::Interrupted))
    }

    /// Release the live subscription of the selected symbol.
    ///
    /// Resolves once the upstream close completed. Called while a subscribe
    /// is still waiting for its acknowledgment, the subscription is closed as
    /// soon as it arrives. The buffer keeps its data.
    pub async fn unsubscribe_ticks(&self) -> ReleaseOutcome {
        let pending = {
            let mut model = self.model.lock();
            let pending = if let Some(symbol) = model.held.take() {
                PendingRelease::Held(symbol)
            } else if let Some(flight) = model
                .in_flight
                .as_mut()
                .filter(|flight| !flight.release_requested)
            {
                flight.release_requested = true;
                tracing::debug!(symbol = %flight.symbol, "Release requested before acknowledgment");
                PendingRelease::InFlight(flight.settled.clone())
            } else {
                return ReleaseOutcome::Noop;
            };
            model.phase = ViewPhase::Unsubscribing;
            self.publish(&mut model);
            pending
        };

        match pending {
            PendingRelease::Held(symbol) => {
                let outcome = self.registry.unsubscribe(&symbol).await;
                self.finish_unsubscribe(&symbol);
                outcome
            }
            PendingRelease::InFlight(mut settled) => settled
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| outcome.as_ref().and_then(|s| s.release))
                .unwrap_or(ReleaseOutcome::Noop),
        }
    }

    /// Re-seed the buffer of the selected symbol from candle history.
    ///
    /// Returns the buffer length after the merge.
    ///
    /// # Errors
    ///
    /// Returns an error if no symbol is selected, the fetch fails, or the
    /// selection changes before the history arrives.
    pub async fn load_history(&self) -> Result<usize, StoreError> {
        let symbol = self.selected_symbol().ok_or(StoreError::NoSymbolSelected)?;

        let ticks = match self
            .history
            .fetch_history(&symbol, self.settings.history_count)
            .await
        {
            Ok(ticks) => ticks,
            Err(e) => {
                self.set_notice(&symbol, e.to_string());
                return Err(e.into());
            }
        };

        let mut model = self.model.lock();
        if !model.is_selected(&symbol) {
            return Err(StoreError::SelectionChanged);
        }
        let len = self.buffer.seed(ticks);
        self.publish(&mut model);
        Ok(len)
    }

    /// Reconnect after the connection failed.
    ///
    /// Subscriptions still held are re-issued once connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn reconnect(&self) -> Result<(), StoreError> {
        if let Err(e) = self.transport.connect().await {
            let mut model = self.model.lock();
            model.notice = Some(e.to_string());
            self.publish(&mut model);
            return Err(e.into());
        }
        Ok(())
    }

    /// Follow transport state changes until `cancel` fires.
    #[must_use]
    pub fn track_connection(
        &self,
        mut states: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                let Some(store) = me.upgrade() else {
                    return;
                };
                store.on_connection_state(state);
                drop(store);

                tokio::select! {
                    () = cancel.cancelled() => return,
                    changed = states.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    fn on_connection_state(&self, state: ConnectionState) {
        let mut model = self.model.lock();
        if model.connection == state {
            return;
        }
        model.connection = state;
        if state == ConnectionState::Failed {
            model.notice = Some("connection failed".to_string());
        }
        self.publish(&mut model);
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn set_notice(&self, symbol: &str, notice: String) {
        let mut model = self.model.lock();
        if model.is_selected(symbol) {
            model.notice = Some(notice);
            self.publish(&mut model);
        }
    }

    fn start_subscribe(
        self: &Arc<Self>,
        model: &mut ViewModel,
        symbol: Symbol,
    ) -> watch::Receiver<Option<Settled>> {
        model.next_attempt += 1;
        let attempt = model.next_attempt;
        let (tx, rx) = watch::channel(None);
        model.in_flight = Some(InFlight {
            attempt,
            symbol: symbol.clone(),
            release_requested: false,
            settled: rx.clone(),
        });
        model.phase = ViewPhase::Subscribing;
        model.notice = None;
        self.publish(model);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.registry.subscribe(&symbol).await;
            let settled = this.settle_subscribe(attempt, &symbol, result).await;
            tx.send_replace(Some(settled));
        });
        rx
    }

    /// Adopt the reference of a finished attempt, or hand it back when the
    /// attempt was superseded or released meanwhile.
    async fn settle_subscribe(
        &self,
        attempt: u64,
        symbol: &str,
        result: Result<(), SubscribeError>,
    ) -> Settled {
        let holds_reference = match &result {
            Ok(()) => true,
            Err(e) => e.reference_retained(),
        };

        let (adopted, selected, finish_view) = {
            let mut model = self.model.lock();
            let flight = model.in_flight.take_if(|flight| flight.attempt == attempt);
            let current = flight.is_some();
            let release_requested = flight.is_none_or(|flight| flight.release_requested);
            let selected = model.is_selected(symbol);
            let adopted = holds_reference && !release_requested && selected && model.held.is_none();
            if adopted {
                model.held = Some(symbol.to_string());
            }

            if current && selected && !release_requested {
                match &result {
                    Ok(()) if adopted => {
                        model.phase = ViewPhase::Live;
                        model.notice = None;
                    }
                    Ok(()) => {}
                    Err(e) if e.reference_retained() => model.notice = Some(e.to_string()),
                    Err(e) => {
                        if model.held.is_none() {
                            model.phase = ViewPhase::Idle;
                        }
                        model.notice = Some(e.to_string());
                    }
                }
                self.publish(&mut model);
            }
            (adopted, selected, current && release_requested)
        };

        let release = if holds_reference && !adopted {
            tracing::debug!(symbol, "Handing back unadopted subscription");
            Some(self.registry.unsubscribe(symbol).await)
        } else {
            None
        };
        if finish_view {
            self.finish_unsubscribe(symbol);
        }

        let subscribe = match result {
            Ok(()) if adopted => Ok(()),
            Ok(()) if !selected => Err(StoreError::SelectionChanged),
            Ok(()) => Err(SubscribeError::Released.into()),
            Err(e) => {
                tracing::warn!(symbol, error = %e, "Subscribe failed");
                Err(e.into())
            }
        };
        Settled { subscribe, release }
    }

    fn finish_unsubscribe(&self, symbol: &str) {
        let mut model = self.model.lock();
        if model.is_selected(symbol)
            && model.held.is_none()
            && model.in_flight.is_none()
            && model.phase == ViewPhase::Unsubscribing
        {
            model.phase = ViewPhase::Idle;
            self.publish(&mut model);
        }
    }

    fn release_in_background(&self, symbol: Symbol) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(symbol = %symbol, "No runtime to release subscription on");
            return;
        };
        let registry = Arc::clone(&self.registry);
        runtime.spawn(async move {
            let outcome = registry.unsubscribe(&symbol).await;
            tracing::debug!(symbol = %symbol, ?outcome, "Released previous selection");
        });
    }

    fn publish(&self, model: &mut ViewModel) {
        model.revision += 1;
        let view = StoreView {
            selected_symbol: model.selected.clone(),
            chart_type: model.chart_type,
            phase: model.phase,
            connection: model.connection,
            notice: model.notice.clone(),
            tick_count: self.buffer.len(),
            last_epoch: self.buffer.last_epoch(),
            revision: model.revision,
        };
        self.view_tx.send_replace(view);
    }
}

impl TickSink for MarketDataStore {
    fn on_ticks(&self, symbol: &str, update: TickUpdate) {
        let mut model = self.model.lock();
        if !model.is_selected(symbol) {
            return;
        }

        match update {
            TickUpdate::Seed(batch) => {
                self.buffer.seed(batch);
                if model.phase == ViewPhase::Subscribing && model.held.is_some() {
                    model.phase = ViewPhase::Live;
                }
            }
            TickUpdate::Live(tick) => {
                if !self.buffer.append(tick) {
                    return;
                }
            }
        }
        self.publish(&mut model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockConnector;
    use crate::application::services::registry::RegistrySettings;
    use crate::infrastructure::deriv::{Correlator, TransportConfig};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn store() -> Arc<MarketDataStore> {
        let transport = Arc::new(Transport::new(
            TransportConfig::new("wss://test.invalid"),
            Arc::new(MockConnector::new()),
        ));
        let correlator = Arc::new(Correlator::new(
            Arc::clone(&transport),
            Duration::from_secs(10),
        ));
        let registry = SubscriptionRegistry::new(
            Arc::clone(&correlator),
            Arc::clone(&transport),
            RegistrySettings::default(),
        );
        let history = HistoryClient::new(Arc::clone(&transport), correlator, 60);
        MarketDataStore::new(
            registry,
            history,
            transport,
            StoreSettings::default(),
            ChartType::default(),
        )
    }

    fn candle(epoch: i64, close: rust_decimal::Decimal) -> Tick {
        Tick::new(epoch, close, close, close, close)
    }

    #[test]
    fn starts_idle_without_selection() {
        let store = store();
        let view = store.view();

        assert_eq!(view.selected_symbol, None);
        assert_eq!(view.phase, ViewPhase::Idle);
        assert_eq!(view.chart_type, ChartType::Candlestick);
        assert_eq!(view.connection, ConnectionState::Disconnected);
    }

    #[test]
    fn ignores_ticks_for_other_symbols() {
        let store = store();
        store.set_selected_symbol("R_100");

        store.on_ticks("R_50", TickUpdate::Live(candle(1, dec!(1))));
        store.on_ticks("R_100", TickUpdate::Live(candle(2, dec!(2))));

        assert_eq!(store.ticks(), vec![candle(2, dec!(2))]);
    }

    #[test]
    fn changing_symbol_clears_buffer() {
        let store = store();
        store.set_selected_symbol("R_100");
        store.on_ticks(
            "R_100",
            TickUpdate::Seed(vec![candle(1, dec!(1)), candle(2, dec!(2))]),
        );
        assert_eq!(store.view().tick_count, 2);

        store.set_selected_symbol("R_50");

        assert!(store.ticks().is_empty());
        let view = store.view();
        assert_eq!(view.selected_symbol.as_deref(), Some("R_50"));
        assert_eq!(view.tick_count, 0);
    }

    #[test]
    fn reselecting_same_symbol_keeps_buffer() {
        let store = store();
        store.set_selected_symbol("R_100");
        store.on_ticks("R_100", TickUpdate::Live(candle(1, dec!(1))));
        let revision = store.view().revision;

        store.set_selected_symbol("R_100");

        assert_eq!(store.ticks().len(), 1);
        assert_eq!(store.view().revision, revision);
    }

    #[test]
    fn chart_type_switch_keeps_buffer_and_reshapes_series() {
        let store = store();
        store.set_selected_symbol("R_100");
        store.on_ticks("R_100", TickUpdate::Live(candle(1_700_000_000, dec!(10))));

        assert!(matches!(store.chart_series()[0], ChartPoint::Candle { .. }));

        store.set_chart_type(ChartType::Line);

        assert_eq!(store.ticks().len(), 1);
        assert_eq!(
            store.chart_series(),
            vec![ChartPoint::Line(1_700_000_000_000, dec!(10))]
        );
        assert_eq!(store.view().chart_type, ChartType::Line);
    }

    #[test]
    fn duplicate_live_tick_does_not_publish() {
        let store = store();
        store.set_selected_symbol("R_100");
        store.on_ticks("R_100", TickUpdate::Live(candle(5, dec!(1))));
        let revision = store.view().revision;

        store.on_ticks("R_100", TickUpdate::Live(candle(5, dec!(1))));

        assert_eq!(store.view().revision, revision);
    }

    #[tokio::test]
    async fn subscribe_without_selection_fails() {
        let store = store();

        assert_eq!(
            store.subscribe_ticks().await,
            Err(StoreError::NoSymbolSelected)
        );
        assert_eq!(store.unsubscribe_ticks().await, ReleaseOutcome::Noop);
    }

    #[tokio::test]
    async fn view_changes_are_streamed() {
        use futures::StreamExt;

        let store = store();
        let mut changes = store.changes();

        let initial = changes.next().await.unwrap();
        assert_eq!(initial.revision, 0);

        store.set_selected_symbol("R_100");
        let next = changes.next().await.unwrap();
        assert_eq!(next.selected_symbol.as_deref(), Some("R_100"));
        assert!(next.revision > initial.revision);
    }

    #[tokio::test]
    async fn failed_connection_sets_notice() {
        let store = store();
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let cancel = CancellationToken::new();
        let task = store.track_connection(rx, cancel.clone());

        tx.send_replace(ConnectionState::Failed);
        let mut views = store.watch();
        let view = views
            .wait_for(|view| view.connection == ConnectionState::Failed)
            .await
            .unwrap()
            .clone();

        assert!(view.notice.is_some());
        cancel.cancel();
        task.await.unwrap();
    }
}
