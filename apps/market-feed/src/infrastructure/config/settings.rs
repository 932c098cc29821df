//! Feed Configuration Settings
//!
//! Configuration types for the market feed, loaded from environment variables.

use std::time::Duration;

use crate::domain::market::ChartType;
use crate::domain::tick_buffer::DEFAULT_TICK_CAPACITY;

/// Default public application id.
pub const DEFAULT_APP_ID: &str = "1089";

/// Candle widths (seconds) accepted by the upstream.
pub const SUPPORTED_GRANULARITIES: [u32; 12] = [
    60, 120, 180, 300, 600, 900, 1800, 3600, 7200, 14400, 28800, 86400,
];

/// Upstream endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Registered application id.
    pub app_id: String,
    /// Explicit WebSocket URL, overriding the one derived from `app_id`.
    pub url: Option<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            url: None,
        }
    }
}

impl EndpointSettings {
    /// WebSocket URL to connect to.
    #[must_use]
    pub fn ws_url(&self) -> String {
        self.url.clone().unwrap_or_else(|| {
            format!("wss://ws.binaryws.com/websockets/v3?app_id={}", self.app_id)
        })
    }
}

/// Socket lifecycle settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Keep-alive ping interval.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnection jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Maximum time spent reconnecting (zero = unlimited).
    pub max_reconnect_elapsed: Duration,
    /// Outbound frame queue capacity.
    pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.2,
            max_reconnect_attempts: 10,
            max_reconnect_elapsed: Duration::from_secs(300),
            outbound_queue_capacity: 256,
        }
    }
}

/// Correlated request settings.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    /// Time a request may stay unanswered.
    pub timeout: Duration,
    /// Time to wait for an unsubscribe before discarding the subscription.
    pub unsubscribe_grace: Duration,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            unsubscribe_grace: Duration::from_secs(5),
        }
    }
}

/// Chart and buffer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSettings {
    /// Ticks retained per symbol.
    pub buffer_capacity: usize,
    /// Candle width in seconds.
    pub granularity: u32,
    /// Candles requested with each subscription.
    pub history_count: usize,
    /// Points handed to the renderer.
    pub window: usize,
    /// Symbol selected on startup.
    pub default_symbol: Option<String>,
    /// Chart type on startup.
    pub default_chart_type: ChartType,
}

impl Default for ChartSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_TICK_CAPACITY,
            granularity: 60,
            history_count: DEFAULT_TICK_CAPACITY,
            window: DEFAULT_TICK_CAPACITY,
            default_symbol: None,
            default_chart_type: ChartType::Candlestick,
        }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone, Default)]
pub struct FeedSettings {
    /// Upstream endpoint.
    pub endpoint: EndpointSettings,
    /// Socket lifecycle.
    pub connection: ConnectionSettings,
    /// Correlated requests.
    pub requests: RequestSettings,
    /// Chart and buffer.
    pub chart: ChartSettings,
}

impl FeedSettings {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let app_id = env
            .get("DERIV_APP_ID")
            .unwrap_or_else(|| DEFAULT_APP_ID.to_string());
        if app_id.trim().is_empty() {
            return Err(ConfigError::EmptyValue("DERIV_APP_ID".to_string()));
        }
        let endpoint = EndpointSettings {
            app_id,
            url: env.get("DERIV_WS_URL").filter(|url| !url.trim().is_empty()),
        };

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            heartbeat_interval: env.duration_secs(
                "MARKET_FEED_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: env.duration_secs(
                "MARKET_FEED_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            )?,
            connect_timeout: env
                .duration_secs("MARKET_FEED_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            reconnect_delay_initial: env.duration_millis(
                "MARKET_FEED_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.duration_secs(
                "MARKET_FEED_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "MARKET_FEED_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            )?,
            reconnect_jitter: env.parse("MARKET_FEED_RECONNECT_JITTER", defaults.reconnect_jitter)?,
            max_reconnect_attempts: env.parse(
                "MARKET_FEED_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            max_reconnect_elapsed: env.duration_secs(
                "MARKET_FEED_MAX_RECONNECT_ELAPSED_SECS",
                defaults.max_reconnect_elapsed,
            )?,
            outbound_queue_capacity: env.parse(
                "MARKET_FEED_OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            )?,
        };

        if !(0.0..1.0).contains(&connection.reconnect_jitter) {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_FEED_RECONNECT_JITTER".to_string(),
                reason: "must be in [0, 1)".to_string(),
            });
        }
        if connection.reconnect_delay_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_FEED_RECONNECT_DELAY_MULTIPLIER".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let defaults = RequestSettings::default();
        let requests = RequestSettings {
            timeout: env.duration_millis("MARKET_FEED_REQUEST_TIMEOUT_MS", defaults.timeout)?,
            unsubscribe_grace: env.duration_millis(
                "MARKET_FEED_UNSUBSCRIBE_GRACE_MS",
                defaults.unsubscribe_grace,
            )?,
        };

        let defaults = ChartSettings::default();
        let chart = ChartSettings {
            buffer_capacity: env.parse("MARKET_FEED_BUFFER_CAPACITY", defaults.buffer_capacity)?,
            granularity: env.parse("MARKET_FEED_GRANULARITY", defaults.granularity)?,
            history_count: env.parse("MARKET_FEED_HISTORY_COUNT", defaults.history_count)?,
            window: env.parse("MARKET_FEED_CHART_WINDOW", defaults.window)?,
            default_symbol: env
                .get("MARKET_FEED_SYMBOL")
                .filter(|symbol| !symbol.trim().is_empty()),
            default_chart_type: env
                .get("MARKET_FEED_CHART_TYPE")
                .map_or(defaults.default_chart_type, |s| {
                    ChartType::from_str_case_insensitive(&s)
                }),
        };

        if chart.buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_FEED_BUFFER_CAPACITY".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !SUPPORTED_GRANULARITIES.contains(&chart.granularity) {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_FEED_GRANULARITY".to_string(),
                reason: format!("{} is not a supported candle width", chart.granularity),
            });
        }

        Ok(Self {
            endpoint,
            connection,
            requests,
            chart,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed or is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.parse::<u64>(key, 0).map(Duration::from_secs),
        }
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.parse::<u64>(key, 0).map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn settings(vars: &[(&str, &str)]) -> Result<FeedSettings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        FeedSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let settings = settings(&[]).unwrap();

        assert_eq!(
            settings.endpoint.ws_url(),
            "wss://ws.binaryws.com/websockets/v3?app_id=1089"
        );
        assert_eq!(settings.connection.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.connection.reconnect_delay_initial, Duration::from_secs(1));
        assert_eq!(settings.connection.reconnect_delay_max, Duration::from_secs(30));
        assert!((settings.connection.reconnect_jitter - 0.2).abs() < f64::EPSILON);
        assert_eq!(settings.requests.timeout, Duration::from_secs(10));
        assert_eq!(settings.chart.buffer_capacity, 300);
        assert_eq!(settings.chart.granularity, 60);
        assert_eq!(settings.chart.default_chart_type, ChartType::Candlestick);
    }

    #[test]
    fn overrides_are_applied() {
        let settings = settings(&[
            ("DERIV_APP_ID", "4242"),
            ("MARKET_FEED_GRANULARITY", "300"),
            ("MARKET_FEED_REQUEST_TIMEOUT_MS", "2500"),
            ("MARKET_FEED_MAX_RECONNECT_ATTEMPTS", "0"),
            ("MARKET_FEED_CHART_TYPE", "LINE"),
            ("MARKET_FEED_SYMBOL", "R_100"),
        ])
        .unwrap();

        assert!(settings.endpoint.ws_url().ends_with("app_id=4242"));
        assert_eq!(settings.chart.granularity, 300);
        assert_eq!(settings.requests.timeout, Duration::from_millis(2500));
        assert_eq!(settings.connection.max_reconnect_attempts, 0);
        assert_eq!(settings.chart.default_chart_type, ChartType::Line);
        assert_eq!(settings.chart.default_symbol.as_deref(), Some("R_100"));
    }

    #[test]
    fn explicit_url_wins() {
        let settings = settings(&[("DERIV_WS_URL", "ws://127.0.0.1:9000")]).unwrap();
        assert_eq!(settings.endpoint.ws_url(), "ws://127.0.0.1:9000");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            settings(&[("MARKET_FEED_GRANULARITY", "61")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings(&[("MARKET_FEED_BUFFER_CAPACITY", "lots")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings(&[("MARKET_FEED_RECONNECT_JITTER", "1.5")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings(&[("DERIV_APP_ID", " ")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn dotenv_file_feeds_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "DERIV_APP_ID=777").unwrap();
        writeln!(file, "MARKET_FEED_BUFFER_CAPACITY=50").unwrap();

        let vars: HashMap<String, String> = dotenvy::from_path_iter(file.path())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        let settings = FeedSettings::from_lookup(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(settings.endpoint.app_id, "777");
        assert_eq!(settings.chart.buffer_capacity, 50);
    }
}
