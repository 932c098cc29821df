//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SubscriptionRegistry`: Reference-counted upstream subscriptions
//! - `MarketDataStore`: Observable facade for a chart view
//! - `CatalogClient`: One-shot instrument catalog fetch
//! - `HistoryClient`: One-shot candle history fetch
//! - `MarketDataSession`: Wires everything for one upstream connection

pub mod catalog;
pub mod history;
pub mod market_data;
pub mod registry;
pub mod session;

pub use catalog::{CatalogClient, CatalogResult, FetchError};
pub use history::HistoryClient;
pub use market_data::{MarketDataStore, StoreError, StoreSettings, StoreView, ViewPhase};
pub use registry::{RegistrySettings, ReleaseOutcome, SubscribeError, SubscriptionRegistry};
pub use session::MarketDataSession;
