//! Market Data Session
//!
//! Owns one upstream connection and everything scoped to it: the transport,
//! the correlator, the subscription registry, the store and the one-shot
//! clients.
//!
//! ```text
//! Connector ─► Transport ─► Correlator ─► SubscriptionRegistry ─► MarketDataStore
//!                  ▲            (FrameHandler)   (StreamListener)     (TickSink)
//!                  └── CatalogClient / HistoryClient
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    ConnectionError, ConnectionState, Connector, FrameHandler, StreamListener, TickSink,
};
use crate::infrastructure::config::FeedSettings;
use crate::infrastructure::deriv::{Correlator, Transport, TransportConfig};

use super::catalog::CatalogClient;
use super::history::HistoryClient;
use super::market_data::{MarketDataStore, StoreSettings};
use super::registry::{RegistrySettings, SubscriptionRegistry};

/// A wired market data pipeline for one upstream endpoint.
#[derive(Debug)]
pub struct MarketDataSession {
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<MarketDataStore>,
    catalog: CatalogClient,
    history: HistoryClient,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataSession {
    /// Wire a session. Nothing connects until [`Self::open`].
    #[must_use]
    pub fn new(settings: &FeedSettings, connector: Arc<dyn Connector>) -> Self {
        let transport = Arc::new(Transport::new(
            TransportConfig::from_settings(settings),
            connector,
        ));

        let correlator = Arc::new(Correlator::new(
            Arc::clone(&transport),
            settings.requests.timeout,
        ));
        let handler: Arc<dyn FrameHandler> = correlator.clone();
        transport.on_message(&handler);

        let registry = SubscriptionRegistry::new(
            Arc::clone(&correlator),
            Arc::clone(&transport),
            RegistrySettings::from_settings(settings),
        );
        let listener: Arc<dyn StreamListener> = registry.clone();
        correlator.set_stream_listener(&listener);

        let history = HistoryClient::new(
            Arc::clone(&transport),
            Arc::clone(&correlator),
            settings.chart.granularity,
        );
        let catalog = CatalogClient::new(Arc::clone(&transport), Arc::clone(&correlator));

        let store = MarketDataStore::new(
            Arc::clone(&registry),
            history.clone(),
            Arc::clone(&transport),
            StoreSettings {
                buffer_capacity: settings.chart.buffer_capacity,
                chart_window: settings.chart.window,
                history_count: settings.chart.history_count,
            },
            settings.chart.default_chart_type,
        );
        let sink: Arc<dyn TickSink> = store.clone();
        registry.add_sink(&sink);

        if let Some(symbol) = &settings.chart.default_symbol {
            store.set_selected_symbol(symbol);
        }

        Self {
            transport,
            correlator,
            registry,
            store,
            catalog,
            history,
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
        }
    }

    /// Connect upstream and start publishing connection state to the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        {
            let mut watcher = self.watcher.lock();
            if watcher.is_none() {
                let states = self.transport.state_changes();
                *watcher = Some(self.store.track_connection(states, self.cancel.child_token()));
            }
        }

        tracing::info!(url = %self.transport.url(), "Opening market data session");
        self.transport.connect().await
    }

    /// Disconnect. In-flight requests resolve as connection lost and every
    /// subscription is dropped.
    pub fn close(&self) {
        tracing::info!(
            pending_requests = self.correlator.pending_count(),
            subscriptions = self.registry.stats().symbol_count,
            "Closing market data session"
        );
        self.transport.disconnect();
    }

    /// The chart facade.
    #[must_use]
    pub const fn store(&self) -> &Arc<MarketDataStore> {
        &self.store
    }

    /// The instrument catalog client.
    #[must_use]
    pub const fn catalog(&self) -> &CatalogClient {
        &self.catalog
    }

    /// The candle history client.
    #[must_use]
    pub const fn history(&self) -> &HistoryClient {
        &self.history
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }
}

impl Drop for MarketDataSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.transport.disconnect();
    }
}
