#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Feed - Live Tick Subscription Pipeline
//!
//! A client library that keeps a single WebSocket connection to the Deriv
//! market data API and multiplexes per-symbol tick subscriptions, history
//! and catalog requests over it, feeding a bounded buffer behind an
//! observable chart facade.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and state machines
//!   - `market`: Ticks, instruments, chart projection
//!   - `tick_buffer`: Bounded rolling tick storage
//!   - `subscription`: Per-symbol refcount state machine
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Socket connector and dispatch callbacks
//!   - `services`: Registry, store, catalog/history clients, session
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `deriv`: Wire codec, reconnecting transport, request correlator
//!   - `config`: Environment-driven settings
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OTLP export
//!
//! # Data Flow
//!
//! ```text
//!                 ┌────────────┐     ┌────────────┐     ┌──────────────┐     ┌─────────────┐
//! Deriv WS ◄─────►│ Transport  │────►│ Correlator │────►│   Registry   │────►│    Store    │──► watch
//!                 └────────────┘     └────────────┘     └──────────────┘     └─────────────┘
//!                   reconnect,         req_id table,      refcount per         TickBuffer,
//!                   keep-alive         stream routing     symbol               chart series
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{CatalogFilter, ChartPoint, ChartType, Instrument, Symbol, Tick};
pub use domain::subscription::{SubscriptionState, SubscriptionStats};
pub use domain::tick_buffer::{DEFAULT_TICK_CAPACITY, TickBuffer};

// Ports
pub use application::ports::{
    Connection, ConnectionError, ConnectionEvent, ConnectionState, Connector, LinkError,
};

// Services
pub use application::services::{
    CatalogClient, CatalogResult, FetchError, HistoryClient, MarketDataSession, MarketDataStore,
    ReleaseOutcome, StoreError, StoreView, SubscribeError, SubscriptionRegistry, ViewPhase,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, FeedSettings};

// Upstream client
pub use infrastructure::deriv::{ProtocolError, RequestError, SendError, WsConnector};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
