//! WebSocket Connector
//!
//! Production [`Connector`] over `tokio-tungstenite`. Text frames are passed
//! through untouched; control frames are handled by tungstenite and a close
//! frame ends the stream with an error.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::application::ports::{Connection, ConnectionError, Connector, LinkError};

/// Connector opening real WebSocket connections (TLS via rustls).
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, ConnectionError> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text.into()))))
            .sink_map_err(|e| LinkError(e.to_string()));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => Some(Err(LinkError(match frame {
                    Some(frame) => format!("closed by upstream: {} {}", frame.code, frame.reason),
                    None => "closed by upstream".to_string(),
                }))),
                Ok(_) => None,
                Err(e) => Some(Err(LinkError(e.to_string()))),
            })
        });

        Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
    }
}
