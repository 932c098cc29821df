//! Configuration Module
//!
//! Configuration loading for the market feed.

mod settings;

pub use settings::{
    ChartSettings, ConfigError, ConnectionSettings, DEFAULT_APP_ID, EndpointSettings,
    FeedSettings, RequestSettings, SUPPORTED_GRANULARITIES,
};
