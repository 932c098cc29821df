//! Catalog Client
//!
//! One-shot fetch of the upstream instrument catalog. Results are not
//! cached and failed fetches are not retried.

use std::sync::Arc;

use crate::application::ports::ConnectionError;
use crate::domain::market::{CatalogFilter, Instrument};
use crate::infrastructure::deriv::{Correlator, Request, RequestError, Response, Transport};

/// A one-shot fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The transport could not be established.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The request failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Outcome of a catalog fetch.
///
/// A failed fetch yields an empty list alongside the error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogResult {
    /// Instruments matching the filter, in upstream order.
    pub instruments: Vec<Instrument>,
    /// Why the fetch failed, if it did.
    pub error: Option<FetchError>,
}

impl CatalogResult {
    /// Whether the fetch succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Fetches the instrument catalog.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
}

impl CatalogClient {
    /// Create a catalog client.
    #[must_use]
    pub const fn new(transport: Arc<Transport>, correlator: Arc<Correlator>) -> Self {
        Self {
            transport,
            correlator,
        }
    }

    /// Fetch the catalog and keep the instruments matching `filter`.
    pub async fn fetch_catalog(&self, filter: &CatalogFilter) -> CatalogResult {
        match self.fetch(filter).await {
            Ok(instruments) => {
                tracing::info!(count = instruments.len(), "Catalog fetched");
                CatalogResult {
                    instruments,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Catalog fetch failed");
                CatalogResult {
                    instruments: Vec::new(),
                    error: Some(e),
                }
            }
        }
    }

    async fn fetch(&self, filter: &CatalogFilter) -> Result<Vec<Instrument>, FetchError> {
        self.transport.ensure_connected().await?;

        match self.correlator.issue(&Request::ActiveSymbols).await? {
            Response::ActiveSymbols(all) => Ok(all
                .into_iter()
                .filter(|instrument| filter.matches(instrument))
                .collect()),
            other => Err(RequestError::UnexpectedResponse(format!("{other:?}")).into()),
        }
    }
}
