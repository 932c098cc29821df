//! Port Interfaces
//!
//! Contracts between the pipeline layers. Infrastructure adapters implement
//! the driven ports; application services implement the callbacks the
//! transport and correlator dispatch into.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: Opens a text-frame socket to the upstream
//!
//! ## Callback Ports
//!
//! - `FrameHandler`: Single dispatch point for inbound frames (correlator)
//! - `StreamListener`: Receives streamed ticks routed by symbol (registry)
//! - `TickSink`: Receives ticks accepted by the registry (store)

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::domain::market::Tick;

// =============================================================================
// Connection Types
// =============================================================================

/// Error raised by an open socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LinkError(pub String);

/// Outbound half of an upstream socket.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = LinkError> + Send>>;

/// Inbound half of an upstream socket.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, LinkError>> + Send>>;

/// An established text-frame socket.
pub struct Connection {
    /// Frames written upstream.
    pub sink: FrameSink,
    /// Frames read from upstream, in arrival order.
    pub stream: FrameStream,
}

impl Connection {
    /// Bundle a sink/stream pair.
    #[must_use]
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// The transport could not be established.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The socket handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The handshake did not complete in time.
    #[error("connect timed out")]
    Timeout,

    /// Reconnection gave up.
    #[error("connection failed: {0}")]
    Failed(String),
}

/// Upstream connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// First handshake in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Socket dropped; backing off before the next attempt.
    Reconnecting,
    /// Reconnect budget exhausted. Terminal until the next `connect`.
    Failed,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Whether the socket is open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether a connection attempt is under way.
    #[must_use]
    pub const fn is_transitional(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

/// Connection lifecycle notifications, delivered on the dispatch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A socket was established; `epoch` increases with every connection.
    Connected {
        /// Connection epoch.
        epoch: u64,
    },
    /// The socket dropped unexpectedly.
    Lost {
        /// Why the socket dropped.
        reason: String,
        /// Whether the transport is about to reconnect.
        reconnecting: bool,
    },
    /// Reconnection gave up.
    Failed {
        /// Last failure.
        reason: String,
    },
    /// The socket was closed locally.
    Closed,
}

// =============================================================================
// Driven Ports
// =============================================================================

/// Opens sockets to the upstream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake with `url`.
    async fn connect(&self, url: &str) -> Result<Connection, ConnectionError>;
}

// =============================================================================
// Callback Ports
// =============================================================================

/// Consumer of every inbound frame of one transport.
///
/// Calls arrive serially, in the order frames were received.
pub trait FrameHandler: Send + Sync {
    /// Handle one raw text frame.
    fn on_frame(&self, text: &str);

    /// Handle a connection lifecycle change.
    fn on_connection_event(&self, event: &ConnectionEvent);

    /// Whether an unexpected closure should be followed by reconnection.
    fn wants_reconnect(&self) -> bool;
}

/// Consumer of streamed data frames.
pub trait StreamListener: Send + Sync {
    /// A streamed tick arrived for `symbol`.
    fn on_stream_tick(&self, symbol: &str, subscription_id: Option<&str>, tick: Tick);

    /// Handle a connection lifecycle change.
    fn on_connection_event(&self, event: &ConnectionEvent);

    /// Whether any consumer still holds a subscription.
    fn has_live_interest(&self) -> bool;
}

/// Ticks forwarded by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickUpdate {
    /// History batch delivered with the subscribe acknowledgment.
    Seed(Vec<Tick>),
    /// One live tick.
    Live(Tick),
}

/// Receiver of accepted ticks.
pub trait TickSink: Send + Sync {
    /// Ticks arrived for `symbol`.
    fn on_ticks(&self, symbol: &str, update: TickUpdate);
}
