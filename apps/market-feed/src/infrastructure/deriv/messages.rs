//! Deriv WebSocket Message Types
//!
//! Wire format types for the Deriv market data API (v3). Requests and
//! responses are single JSON objects; responses echo the request's integer
//! `req_id` and carry a `msg_type` discriminator.
//!
//! # Message Types
//!
//! ## Requests
//! - `ticks_history`: Candle history, optionally followed by a live stream
//! - `forget`: Cancel a live stream by subscription id
//! - `active_symbols`: Instrument catalog
//! - `ping`: Keep-alive
//!
//! ## Responses
//! - `candles`: History batch (plus `subscription.id` when streaming)
//! - `ohlc`: Streamed candle update
//! - `tick`: Streamed spot quote
//! - `forget`: Stream cancellation result
//! - `active_symbols`: Catalog listing
//! - `ping`: Keep-alive reply
//!
//! Any response may instead carry an `error` object.
//!
//! # References
//!
//! - [API explorer](https://api.deriv.com/api-explorer)

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::{Instrument, Symbol, Tick};

/// Request identifier echoed by the upstream.
pub type RequestId = u64;

/// Keep-alive frame; sent outside request correlation.
pub const PING_FRAME: &str = r#"{"ping":1}"#;

// =============================================================================
// Requests
// =============================================================================

/// Logical request kinds, used for bookkeeping and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Stream subscribe.
    Subscribe,
    /// Stream unsubscribe.
    Unsubscribe,
    /// One-shot history fetch.
    HistoryFetch,
    /// Instrument catalog fetch.
    CatalogFetch,
}

impl RequestKind {
    /// Get the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::HistoryFetch => "history_fetch",
            Self::CatalogFetch => "catalog_fetch",
        }
    }
}

/// A request the correlator can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Candle history followed by a live `ohlc` stream.
    SubscribeCandles {
        /// Symbol to stream.
        symbol: Symbol,
        /// Candle width in seconds.
        granularity: u32,
        /// Number of history candles returned with the acknowledgment.
        count: usize,
    },
    /// One-shot candle history.
    CandleHistory {
        /// Symbol to fetch.
        symbol: Symbol,
        /// Candle width in seconds.
        granularity: u32,
        /// Number of candles.
        count: usize,
    },
    /// Cancel a live stream.
    Forget {
        /// Upstream subscription id.
        subscription_id: String,
    },
    /// Instrument catalog.
    ActiveSymbols,
}

impl Request {
    /// Kind of this request.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::SubscribeCandles { .. } => RequestKind::Subscribe,
            Self::CandleHistory { .. } => RequestKind::HistoryFetch,
            Self::Forget { .. } => RequestKind::Unsubscribe,
            Self::ActiveSymbols => RequestKind::CatalogFetch,
        }
    }

    /// Symbol this request concerns, if any.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::SubscribeCandles { symbol, .. } | Self::CandleHistory { symbol, .. } => {
                Some(symbol.as_str())
            }
            Self::Forget { .. } | Self::ActiveSymbols => None,
        }
    }

    /// Build the wire representation for the given request id.
    #[must_use]
    pub fn to_wire(&self, req_id: RequestId) -> WireRequest<'_> {
        match self {
            Self::SubscribeCandles {
                symbol,
                granularity,
                count,
            } => WireRequest::TicksHistory(TicksHistoryRequest::candles(
                symbol,
                *granularity,
                *count,
                true,
                req_id,
            )),
            Self::CandleHistory {
                symbol,
                granularity,
                count,
            } => WireRequest::TicksHistory(TicksHistoryRequest::candles(
                symbol,
                *granularity,
                *count,
                false,
                req_id,
            )),
            Self::Forget { subscription_id } => WireRequest::Forget(ForgetRequest {
                forget: subscription_id,
                req_id,
            }),
            Self::ActiveSymbols => WireRequest::ActiveSymbols(ActiveSymbolsRequest {
                active_symbols: "brief",
                product_type: "basic",
                req_id,
            }),
        }
    }
}

/// Serializable request frame.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WireRequest<'a> {
    /// `ticks_history` request.
    TicksHistory(TicksHistoryRequest<'a>),
    /// `forget` request.
    Forget(ForgetRequest<'a>),
    /// `active_symbols` request.
    ActiveSymbols(ActiveSymbolsRequest),
}

/// History request.
///
/// # Wire Format (JSON)
/// ```json
/// {"ticks_history":"R_100","adjust_start_time":1,"count":300,"end":"latest",
///  "start":1,"style":"candles","granularity":60,"subscribe":1,"req_id":3}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct TicksHistoryRequest<'a> {
    /// Symbol.
    pub ticks_history: &'a str,
    /// Shift the start to the last trading period when the market is closed.
    pub adjust_start_time: u8,
    /// Number of candles.
    pub count: usize,
    /// End of the window.
    pub end: &'static str,
    /// Start of the window (Unix seconds).
    pub start: i64,
    /// `candles` or `ticks`.
    pub style: &'static str,
    /// Candle width in seconds.
    pub granularity: u32,
    /// `1` to keep streaming after the history batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<u8>,
    /// Correlation id.
    pub req_id: RequestId,
}

impl<'a> TicksHistoryRequest<'a> {
    const fn candles(
        symbol: &'a str,
        granularity: u32,
        count: usize,
        subscribe: bool,
        req_id: RequestId,
    ) -> Self {
        Self {
            ticks_history: symbol,
            adjust_start_time: 1,
            count,
            end: "latest",
            start: 1,
            style: "candles",
            granularity,
            subscribe: if subscribe { Some(1) } else { None },
            req_id,
        }
    }
}

/// Stream cancellation request.
///
/// # Wire Format (JSON)
/// ```json
/// {"forget":"c84a793b-8a87-7999-ce10-9b22f7ceead3","req_id":4}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ForgetRequest<'a> {
    /// Upstream subscription id.
    pub forget: &'a str,
    /// Correlation id.
    pub req_id: RequestId,
}

/// Catalog request.
///
/// # Wire Format (JSON)
/// ```json
/// {"active_symbols":"brief","product_type":"basic","req_id":5}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSymbolsRequest {
    /// Listing detail level.
    pub active_symbols: &'static str,
    /// Product type.
    pub product_type: &'static str,
    /// Correlation id.
    pub req_id: RequestId,
}

// =============================================================================
// Responses
// =============================================================================

/// Envelope fields common to every response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    /// Response discriminator.
    #[serde(default)]
    pub msg_type: Option<String>,
    /// Echoed correlation id.
    #[serde(default)]
    pub req_id: Option<RequestId>,
    /// Error payload, when the request failed.
    #[serde(default)]
    pub error: Option<UpstreamError>,
    /// Stream handle, present on streamed frames and stream acknowledgments.
    #[serde(default)]
    pub subscription: Option<SubscriptionInfo>,
}

/// Error payload.
///
/// # Wire Format (JSON)
/// ```json
/// {"error":{"code":"MarketIsClosed","message":"This market is presently closed."},
///  "msg_type":"ticks_history","req_id":3}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamError {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Stream handle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionInfo {
    /// Upstream subscription id.
    pub id: String,
}

/// One candle of a history batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CandleMessage {
    /// Candle open time (Unix seconds).
    pub epoch: i64,
    /// Open.
    pub open: Decimal,
    /// High.
    pub high: Decimal,
    /// Low.
    pub low: Decimal,
    /// Close.
    pub close: Decimal,
}

impl From<CandleMessage> for Tick {
    fn from(c: CandleMessage) -> Self {
        Self::new(c.epoch, c.open, c.high, c.low, c.close)
    }
}

/// History batch response body.
#[derive(Debug, Clone, Deserialize)]
pub struct CandlesMessage {
    /// Candles, oldest first.
    #[serde(default)]
    pub candles: Vec<CandleMessage>,
}

/// Streamed candle update.
///
/// # Wire Format (JSON)
/// ```json
/// {"ohlc":{"close":"1272.61","epoch":1700000061,"granularity":60,"high":"1272.70",
///  "id":"c84a...","low":"1272.35","open":"1272.40","open_time":1700000040,
///  "pip_size":2,"symbol":"R_100"},"msg_type":"ohlc","subscription":{"id":"c84a..."}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OhlcMessage {
    /// Symbol.
    pub symbol: Symbol,
    /// Update time (Unix seconds).
    pub epoch: i64,
    /// Candle open time (Unix seconds).
    #[serde(default)]
    pub open_time: Option<i64>,
    /// Candle width in seconds.
    #[serde(default)]
    pub granularity: Option<u32>,
    /// Open.
    pub open: Decimal,
    /// High.
    pub high: Decimal,
    /// Low.
    pub low: Decimal,
    /// Close.
    pub close: Decimal,
}

impl From<&OhlcMessage> for Tick {
    fn from(m: &OhlcMessage) -> Self {
        Self::new(m.epoch, m.open, m.high, m.low, m.close)
    }
}

/// Streamed spot quote.
///
/// # Wire Format (JSON)
/// ```json
/// {"tick":{"ask":1272.84,"bid":1272.64,"epoch":1700000061,"id":"b2f1...",
///  "pip_size":2,"quote":1272.74,"symbol":"R_100"},"msg_type":"tick"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickMessage {
    /// Symbol.
    pub symbol: Symbol,
    /// Quote time (Unix seconds).
    pub epoch: i64,
    /// Spot price.
    pub quote: Decimal,
}

impl From<&TickMessage> for Tick {
    fn from(m: &TickMessage) -> Self {
        Self::spot(m.epoch, m.quote)
    }
}

/// Catalog entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveSymbolMessage {
    /// Symbol code.
    pub symbol: Symbol,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Market.
    #[serde(default)]
    pub market: String,
    /// Symbol type.
    #[serde(default)]
    pub symbol_type: String,
    /// `1` when forward-starting contracts are offered.
    #[serde(default)]
    pub allow_forward_starting: u8,
}

impl From<ActiveSymbolMessage> for Instrument {
    fn from(m: ActiveSymbolMessage) -> Self {
        Self {
            symbol: m.symbol,
            display_name: m.display_name,
            market: m.market,
            symbol_type: m.symbol_type,
            allow_forward_starting: m.allow_forward_starting == 1,
        }
    }
}

// =============================================================================
// Decoded Frames
// =============================================================================

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Echoed correlation id.
    pub req_id: Option<RequestId>,
    /// Stream handle, when present.
    pub subscription_id: Option<String>,
    /// Decoded body.
    pub body: InboundBody,
}

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundBody {
    /// History batch (stream acknowledgment when a subscription id is set).
    Candles(Vec<Tick>),
    /// Streamed tick for a symbol.
    Stream {
        /// Symbol.
        symbol: Symbol,
        /// Tick.
        tick: Tick,
    },
    /// Stream cancellation result.
    Forgotten(bool),
    /// Catalog listing.
    ActiveSymbols(Vec<Instrument>),
    /// Keep-alive reply.
    Pong,
    /// Request failure.
    Error(UpstreamError),
}

impl InboundBody {
    /// Whether this body is streamed data routed by symbol.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn subscribe_request_wire_format() {
        let request = Request::SubscribeCandles {
            symbol: "R_100".to_string(),
            granularity: 60,
            count: 300,
        };

        let json = serde_json::to_value(request.to_wire(7)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "ticks_history": "R_100",
                "adjust_start_time": 1,
                "count": 300,
                "end": "latest",
                "start": 1,
                "style": "candles",
                "granularity": 60,
                "subscribe": 1,
                "req_id": 7
            })
        );
    }

    #[test]
    fn history_request_has_no_subscribe_flag() {
        let request = Request::CandleHistory {
            symbol: "R_50".to_string(),
            granularity: 120,
            count: 10,
        };

        let json = serde_json::to_value(request.to_wire(1)).unwrap();

        assert!(json.get("subscribe").is_none());
        assert_eq!(json["granularity"], 120);
        assert_eq!(request.kind(), RequestKind::HistoryFetch);
        assert_eq!(request.symbol(), Some("R_50"));
    }

    #[test]
    fn forget_and_catalog_wire_format() {
        let forget = Request::Forget {
            subscription_id: "abc".to_string(),
        };
        assert_eq!(
            serde_json::to_value(forget.to_wire(2)).unwrap(),
            serde_json::json!({"forget": "abc", "req_id": 2})
        );

        assert_eq!(
            serde_json::to_value(Request::ActiveSymbols.to_wire(3)).unwrap(),
            serde_json::json!({"active_symbols": "brief", "product_type": "basic", "req_id": 3})
        );
    }

    #[test]
    fn ohlc_prices_parse_from_strings() {
        let msg: OhlcMessage = serde_json::from_str(
            r#"{"close":"1272.61","epoch":1700000061,"granularity":60,"high":"1272.70",
                "id":"x","low":"1272.35","open":"1272.40","open_time":1700000040,
                "pip_size":2,"symbol":"R_100"}"#,
        )
        .unwrap();

        let tick = Tick::from(&msg);
        assert_eq!(tick.close, dec!(1272.61));
        assert_eq!(tick.epoch, 1_700_000_061);
        assert_eq!(msg.open_time, Some(1_700_000_040));
    }

    #[test]
    fn active_symbol_flag_maps_to_bool() {
        let msg: ActiveSymbolMessage = serde_json::from_str(
            r#"{"symbol":"OTC_AEX","display_name":"Netherlands 25","market":"indices",
                "symbol_type":"stockindex","allow_forward_starting":1,"exchange_is_open":1}"#,
        )
        .unwrap();

        let instrument = Instrument::from(msg);
        assert!(instrument.allow_forward_starting);
        assert_eq!(instrument.market, "indices");
    }

    #[test]
    fn request_kind_as_str() {
        assert_eq!(RequestKind::Subscribe.as_str(), "subscribe");
        assert_eq!(RequestKind::Unsubscribe.as_str(), "unsubscribe");
        assert_eq!(RequestKind::HistoryFetch.as_str(), "history_fetch");
        assert_eq!(RequestKind::CatalogFetch.as_str(), "catalog_fetch");
    }
}
