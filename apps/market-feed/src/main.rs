//! Market Feed Binary
//!
//! Connects to the Deriv API, lists the synthetic stock indices, subscribes
//! to one of them and logs the chart state until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-feed
//! ```
//!
//! # Environment Variables
//!
//! - `DERIV_APP_ID`: Deriv application id (default: 1089)
//! - `DERIV_WS_URL`: Full WebSocket URL override
//! - `MARKET_FEED_SYMBOL`: Symbol to chart (default: first catalog entry)
//! - `MARKET_FEED_CHART_TYPE`: line | candlestick (default: candlestick)
//! - `MARKET_FEED_*`: Connection, request and buffer tuning (see `FeedSettings`)
//! - `OTEL_ENABLED`: Export traces over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::Context;
use futures::StreamExt;
use market_feed::domain::market::CatalogFilter;
use market_feed::infrastructure::telemetry;
use market_feed::{FeedSettings, MarketDataSession, MarketDataStore, WsConnector, init_metrics};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting market feed");

    let metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let settings = FeedSettings::from_env().context("invalid configuration")?;
    log_settings(&settings);

    let session = MarketDataSession::new(&settings, Arc::new(WsConnector::new()));
    session.open().await.context("failed to connect upstream")?;

    let catalog = session
        .catalog()
        .fetch_catalog(&CatalogFilter::synthetic_stock_indices())
        .await;
    if let Some(e) = &catalog.error {
        tracing::warn!(error = %e, "Catalog unavailable");
    }
    for instrument in &catalog.instruments {
        tracing::info!(
            symbol = %instrument.symbol,
            name = %instrument.display_name,
            "Instrument available"
        );
    }

    let store = Arc::clone(session.store());
    if store.selected_symbol().is_none() {
        let first = catalog
            .instruments
            .first()
            .context("no symbol configured and the catalog is empty")?;
        store.set_selected_symbol(&first.symbol);
    }

    store.subscribe_ticks().await.context("failed to subscribe")?;

    let shutdown = CancellationToken::new();
    let logger = tokio::spawn(log_views(Arc::clone(&store), shutdown.clone()));

    await_shutdown().await;
    shutdown.cancel();
    let _ = logger.await;

    let outcome = store.unsubscribe_ticks().await;
    tracing::info!(?outcome, "Unsubscribed");
    session.close();

    tracing::debug!(metrics = %metrics_handle.render(), "Final metrics");
    tracing::info!("Market feed stopped");
    Ok(())
}

/// Log every published view until shutdown.
async fn log_views(store: Arc<MarketDataStore>, shutdown: CancellationToken) {
    let mut changes = store.changes();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            view = changes.next() => {
                let Some(view) = view else { return };
                let close = store.ticks().last().map(|tick| tick.close);
                tracing::info!(
                    symbol = view.selected_symbol.as_deref().unwrap_or("-"),
                    phase = view.phase.as_str(),
                    connection = view.connection.as_str(),
                    chart_type = view.chart_type.as_str(),
                    ticks = view.tick_count,
                    close = ?close,
                    notice = view.notice.as_deref().unwrap_or(""),
                    "View updated"
                );
            }
        }
    }
}

/// Log the parsed configuration.
fn log_settings(settings: &FeedSettings) {
    tracing::info!(
        app_id = %settings.endpoint.app_id,
        granularity = settings.chart.granularity,
        buffer_capacity = settings.chart.buffer_capacity,
        chart_type = settings.chart.default_chart_type.as_str(),
        "Configuration loaded"
    );
    tracing::debug!(url = %settings.endpoint.ws_url(), "Upstream endpoint");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
