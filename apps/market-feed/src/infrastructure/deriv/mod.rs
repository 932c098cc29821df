//! Deriv WebSocket Client
//!
//! Connection plumbing for the Deriv market data API: wire messages, the
//! frame codec, the reconnecting transport with keep-alive, and the
//! request/response correlator.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = Arc::new(Transport::new(
//!     TransportConfig::from_settings(&settings),
//!     Arc::new(WsConnector::new()),
//! ));
//! let correlator = Arc::new(Correlator::new(Arc::clone(&transport), settings.requests.timeout));
//! let handler: Arc<dyn FrameHandler> = correlator.clone();
//! transport.on_message(&handler);
//! transport.connect().await?;
//!
//! let response = correlator.issue(&Request::ActiveSymbols).await?;
//! ```

pub mod codec;
pub mod connector;
pub mod correlator;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod transport;

pub use codec::{JsonCodec, ProtocolError};
pub use connector::WsConnector;
pub use correlator::{Correlator, PendingResponse, RequestError, Response};
pub use messages::{Request, RequestId, RequestKind};
pub use transport::{SendError, Transport, TransportConfig};
