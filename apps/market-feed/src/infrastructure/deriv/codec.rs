//! Frame Codec
//!
//! JSON encoding of outbound requests and decoding of inbound frames.
//!
//! Inbound frames are classified by their `msg_type` field. An `error`
//! object takes precedence over the body, so a failed request always
//! decodes to [`InboundBody::Error`] regardless of its `msg_type`.

use crate::infrastructure::deriv::messages::{
    ActiveSymbolMessage, CandlesMessage, Envelope, InboundBody, InboundFrame, OhlcMessage, Request,
    RequestId, TickMessage,
};

/// Codec errors.
///
/// Decoding failures surface as protocol errors: the frame is logged and
/// dropped without affecting other traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Frame lacks a `msg_type` and an `error`.
    #[error("frame has no msg_type")]
    MissingMessageType,

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the market data API.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a request with its correlation id.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_request(&self, request: &Request, req_id: RequestId) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&request.to_wire(req_id))?)
    }

    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object, lacks a message
    /// type, or its body does not match the declared type.
    pub fn decode(&self, text: &str) -> Result<InboundFrame, ProtocolError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return Err(ProtocolError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )));
        }

        let mut value: serde_json::Value = serde_json::from_str(trimmed)?;
        let envelope: Envelope = serde_json::from_value(value.clone())?;

        let req_id = envelope.req_id;
        let subscription_id = envelope.subscription.map(|s| s.id);

        if let Some(error) = envelope.error {
            return Ok(InboundFrame {
                req_id,
                subscription_id,
                body: InboundBody::Error(error),
            });
        }

        let msg_type = envelope.msg_type.ok_or(ProtocolError::MissingMessageType)?;

        let body = match msg_type.as_str() {
            "candles" => {
                let m: CandlesMessage = serde_json::from_value(value)?;
                InboundBody::Candles(m.candles.into_iter().map(Into::into).collect())
            }
            "ohlc" => {
                let m: OhlcMessage = serde_json::from_value(take_field(&mut value, "ohlc")?)?;
                InboundBody::Stream {
                    tick: (&m).into(),
                    symbol: m.symbol,
                }
            }
            "tick" => {
                let m: TickMessage = serde_json::from_value(take_field(&mut value, "tick")?)?;
                InboundBody::Stream {
                    tick: (&m).into(),
                    symbol: m.symbol,
                }
            }
            "forget" => {
                let forgotten = value
                    .get("forget")
                    .and_then(serde_json::Value::as_u64)
                    .is_some_and(|v| v == 1);
                InboundBody::Forgotten(forgotten)
            }
            "active_symbols" => {
                let list: Vec<ActiveSymbolMessage> =
                    serde_json::from_value(take_field(&mut value, "active_symbols")?)?;
                InboundBody::ActiveSymbols(list.into_iter().map(Into::into).collect())
            }
            "ping" => InboundBody::Pong,
            other => return Err(ProtocolError::UnknownMessageType(other.to_string())),
        };

        Ok(InboundFrame {
            req_id,
            subscription_id,
            body,
        })
    }
}

fn take_field(value: &mut serde_json::Value, field: &str) -> Result<serde_json::Value, ProtocolError> {
    value
        .get_mut(field)
        .map(serde_json::Value::take)
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("missing `{field}` body")))
}
