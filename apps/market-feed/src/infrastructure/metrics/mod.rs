//! Prometheus Metrics Module
//!
//! Pipeline instrumentation through the `metrics` facade. Recording is a
//! no-op until a recorder is installed, so library users and tests pay
//! nothing unless the binary calls [`init_metrics`].
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames and malformed frames
//! - **Ticks**: Ticks ingested and dropped by reason
//! - **Requests**: Requests issued, timeouts, and latency by kind
//! - **Connection**: Reconnect attempts and connection state
//! - **Subscriptions**: Upstream subscriptions held

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::ports::ConnectionState;
use crate::infrastructure::deriv::messages::RequestKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe every metric.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_feed_frames_received_total",
        "Total frames received from the upstream socket"
    );
    describe_counter!(
        "market_feed_malformed_frames_total",
        "Total inbound frames dropped because they could not be decoded"
    );

    describe_counter!(
        "market_feed_ticks_ingested_total",
        "Total streamed ticks forwarded to consumers"
    );
    describe_counter!(
        "market_feed_ticks_dropped_total",
        "Total streamed ticks dropped by reason"
    );

    describe_counter!(
        "market_feed_requests_total",
        "Total correlated requests issued by kind"
    );
    describe_counter!(
        "market_feed_request_timeouts_total",
        "Total correlated requests that timed out by kind"
    );
    describe_histogram!(
        "market_feed_request_duration_seconds",
        "Time from request send to response by kind"
    );

    describe_counter!(
        "market_feed_reconnects_total",
        "Total reconnection attempts"
    );
    describe_gauge!(
        "market_feed_connection_state",
        "1 for the current connection state, 0 otherwise"
    );

    describe_gauge!(
        "market_feed_upstream_subscriptions",
        "Upstream subscriptions currently tracked"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame read from the upstream socket.
pub fn record_frame_received() {
    counter!("market_feed_frames_received_total").increment(1);
}

/// Record a frame dropped by the codec.
pub fn record_malformed_frame() {
    counter!("market_feed_malformed_frames_total").increment(1);
}

/// Record a tick forwarded to consumers.
pub fn record_tick_ingested() {
    counter!("market_feed_ticks_ingested_total").increment(1);
}

/// Record a dropped tick.
pub fn record_tick_dropped(reason: &'static str) {
    counter!("market_feed_ticks_dropped_total", "reason" => reason).increment(1);
}

/// Record a request sent upstream.
pub fn record_request(kind: RequestKind) {
    counter!("market_feed_requests_total", "kind" => kind.as_str()).increment(1);
}

/// Record a request timeout.
pub fn record_request_timeout(kind: RequestKind) {
    counter!("market_feed_request_timeouts_total", "kind" => kind.as_str()).increment(1);
}

/// Record request round-trip duration.
pub fn record_request_duration(kind: RequestKind, duration: Duration) {
    histogram!("market_feed_request_duration_seconds", "kind" => kind.as_str())
        .record(duration.as_secs_f64());
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("market_feed_reconnects_total").increment(1);
}

/// Publish the current connection state.
pub fn set_connection_state(current: ConnectionState) {
    for state in [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
        ConnectionState::Failed,
    ] {
        let value = if state == current { 1.0 } else { 0.0 };
        gauge!("market_feed_connection_state", "state" => state.as_str()).set(value);
    }
}

/// Publish the number of tracked upstream subscriptions.
pub fn set_upstream_subscriptions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("market_feed_upstream_subscriptions").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received();
        record_malformed_frame();
        record_tick_dropped("stale");
        record_request(RequestKind::Subscribe);
        record_request_duration(RequestKind::CatalogFetch, Duration::from_millis(12));
        set_connection_state(ConnectionState::Connected);
        set_upstream_subscriptions(2);
    }

    #[test]
    fn init_metrics_is_idempotent() {
        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();

        record_reconnect();

        assert!(second.render().contains("market_feed_reconnects_total"));
        drop(first);
    }
}
