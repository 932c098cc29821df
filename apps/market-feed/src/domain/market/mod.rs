//! Market Data Types
//!
//! Canonical internal representation of market data: OHLC ticks,
//! tradable instruments, catalog filters, and the chart projection
//! consumed by renderers.
//!
//! # Sections
//!
//! - **Ticks**: `Tick` and its time helpers
//! - **Instruments**: `Instrument` and `CatalogFilter`
//! - **Charting**: `ChartType`, `ChartPoint`, and `project`

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A market symbol (e.g. `R_100`, `1HZ10V`).
pub type Symbol = String;

// =============================================================================
// Ticks
// =============================================================================

/// A single OHLC observation for one symbol.
///
/// Streams that only carry a spot quote are represented with
/// `open == high == low == close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Observation time in Unix seconds.
    pub epoch: i64,
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing (latest) price.
    pub close: Decimal,
}

impl Tick {
    /// Create a tick from its OHLC components.
    #[must_use]
    pub const fn new(epoch: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
        Self {
            epoch,
            open,
            high,
            low,
            close,
        }
    }

    /// Create a tick from a single spot quote.
    #[must_use]
    pub const fn spot(epoch: i64, quote: Decimal) -> Self {
        Self::new(epoch, quote, quote, quote, quote)
    }

    /// Observation time in Unix milliseconds.
    #[must_use]
    pub const fn epoch_millis(&self) -> i64 {
        self.epoch.saturating_mul(1000)
    }

    /// Observation time as a UTC timestamp, if representable.
    #[must_use]
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.epoch, 0)
    }
}

// =============================================================================
// Instruments
// =============================================================================

/// A tradable instrument as listed by the upstream catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Upstream symbol code.
    pub symbol: Symbol,
    /// Human-readable name.
    pub display_name: String,
    /// Market the instrument belongs to (e.g. `synthetic_index`).
    pub market: String,
    /// Instrument category within the market (e.g. `stockindex`).
    pub symbol_type: String,
    /// Whether forward-starting contracts are offered.
    pub allow_forward_starting: bool,
}

/// Criteria applied to the instrument catalog.
///
/// Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFilter {
    /// Required market.
    pub market: Option<String>,
    /// Required symbol type.
    pub symbol_type: Option<String>,
    /// Required forward-starting flag.
    pub allow_forward_starting: Option<bool>,
}

impl CatalogFilter {
    /// Filter that matches every instrument.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// The trade screen's default listing: synthetic stock indices that
    /// allow forward-starting contracts.
    #[must_use]
    pub fn synthetic_stock_indices() -> Self {
        Self {
            market: Some("synthetic_index".to_string()),
            symbol_type: Some("stockindex".to_string()),
            allow_forward_starting: Some(true),
        }
    }

    /// Check whether an instrument satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, instrument: &Instrument) -> bool {
        self.market
            .as_ref()
            .is_none_or(|market| *market == instrument.market)
            && self
                .symbol_type
                .as_ref()
                .is_none_or(|symbol_type| *symbol_type == instrument.symbol_type)
            && self
                .allow_forward_starting
                .is_none_or(|allowed| allowed == instrument.allow_forward_starting)
    }
}

// =============================================================================
// Charting
// =============================================================================

/// Chart rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    /// Close-price line.
    Line,
    /// OHLC candles.
    #[default]
    Candlestick,
}

impl ChartType {
    /// Parse a chart type, defaulting to candlestick for unknown input.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "line" => Self::Line,
            _ => Self::Candlestick,
        }
    }

    /// Get the chart type name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Candlestick => "candlestick",
        }
    }
}

/// One point handed to a chart renderer.
///
/// Serializes as `{"x", "o", "h", "l", "c"}` for candles and as an
/// `[epoch_millis, close]` pair for lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ChartPoint {
    /// Candlestick point.
    Candle {
        /// Time in Unix milliseconds.
        x: i64,
        /// Open.
        o: Decimal,
        /// High.
        h: Decimal,
        /// Low.
        l: Decimal,
        /// Close.
        c: Decimal,
    },
    /// Line point: time in Unix milliseconds and close.
    Line(i64, Decimal),
}

impl ChartPoint {
    /// Project a single tick into the given chart shape.
    #[must_use]
    pub const fn from_tick(tick: &Tick, chart_type: ChartType) -> Self {
        match chart_type {
            ChartType::Candlestick => Self::Candle {
                x: tick.epoch_millis(),
                o: tick.open,
                h: tick.high,
                l: tick.low,
                c: tick.close,
            },
            ChartType::Line => Self::Line(tick.epoch_millis(), tick.close),
        }
    }
}

/// Project the newest `window` ticks into chart points, oldest first.
#[must_use]
pub fn project(ticks: &[Tick], chart_type: ChartType, window: usize) -> Vec<ChartPoint> {
    let skip = ticks.len().saturating_sub(window);
    ticks[skip..]
        .iter()
        .map(|tick| ChartPoint::from_tick(tick, chart_type))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
