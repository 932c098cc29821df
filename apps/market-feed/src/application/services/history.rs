//! History Client
//!
//! One-shot candle history without a live subscription.

use std::sync::Arc;

use crate::domain::market::Tick;
use crate::infrastructure::deriv::{Correlator, Request, RequestError, Response, Transport};

use super::catalog::FetchError;

/// Fetches candle history.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    granularity: u32,
}

impl HistoryClient {
    /// Create a history client fetching candles of `granularity` seconds.
    #[must_use]
    pub const fn new(
        transport: Arc<Transport>,
        correlator: Arc<Correlator>,
        granularity: u32,
    ) -> Self {
        Self {
            transport,
            correlator,
            granularity,
        }
    }

    /// Fetch the newest `count` candles of `symbol`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be established or the
    /// request fails.
    pub async fn fetch_history(&self, symbol: &str, count: usize) -> Result<Vec<Tick>, FetchError> {
        self.transport.ensure_connected().await?;

        let request = Request::CandleHistory {
            symbol: symbol.to_string(),
            granularity: self.granularity,
            count,
        };

        match self.correlator.issue(&request).await? {
            Response::Candles { mut ticks, .. } => {
                ticks.sort_by_key(|tick| tick.epoch);
                tracing::debug!(symbol, count = ticks.len(), "History fetched");
                Ok(ticks)
            }
            other => Err(RequestError::UnexpectedResponse(format!("{other:?}")).into()),
        }
    }
}
