//! Reconnection Policy
//!
//! Bounded exponential backoff with jitter for re-establishing the upstream
//! socket after an unexpected closure.
//!
//! The policy gives up (returns `None`) once either the attempt budget or
//! the elapsed-time budget is spent; the transport then reports `Failed`.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::infrastructure::config::ConnectionSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound of a single delay.
    pub max_delay: Duration,
    /// Growth factor applied after each attempt.
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.2 = ±20% randomization).
    pub jitter_factor: f64,
    /// Attempt budget (0 = unlimited).
    pub max_attempts: u32,
    /// Maximum time spent reconnecting (zero = unlimited).
    pub max_elapsed: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 10,
            max_elapsed: Duration::from_secs(300),
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `ConnectionSettings`.
    #[must_use]
    pub const fn from_connection_settings(settings: &ConnectionSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: settings.reconnect_jitter,
            max_attempts: settings.max_reconnect_attempts,
            max_elapsed: settings.max_reconnect_elapsed,
        }
    }
}

/// Backoff state for one reconnection episode.
///
/// # Example
///
/// ```rust
/// use market_feed::infrastructure::deriv::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// let first = policy.next_delay().unwrap();
/// assert!(first.as_millis() >= 800 && first.as_millis() <= 1200);
///
/// // connection restored
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
    started_at: Option<Instant>,
}

impl ReconnectPolicy {
    /// Create a policy at its initial delay.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
            started_at: None,
        }
    }

    /// Delay before the next attempt.
    ///
    /// Returns `None` once the attempt or elapsed-time budget is exhausted.
    /// The elapsed-time budget starts at the first call after a reset.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        if !self.config.max_elapsed.is_zero() && started_at.elapsed() >= self.config.max_elapsed {
            return None;
        }

        self.attempt_count += 1;

        let delay = self.jittered(self.current_delay);
        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max_delay);

        Some(delay)
    }

    /// Start a fresh episode after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
        self.started_at = None;
    }

    /// Attempts made in the current episode.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Maximum number of attempts (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Spread `base` uniformly over `base * (1 ± jitter_factor)`, never
    /// below one millisecond.
    fn jittered(&self, base: Duration) -> Duration {
        let spread = self.config.jitter_factor.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return base;
        }

        let factor = rand::rng().random_range(1.0 - spread..=1.0 + spread);
        base.mul_f64(factor).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
            max_elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn defaults_match_backoff_bounds() {
        let config = ReconnectConfig::default();
        assert_eq!(
            (config.initial_delay, config.max_delay, config.max_elapsed),
            (
                Duration::from_secs(1),
                Duration::from_secs(30),
                Duration::from_secs(300)
            )
        );
        assert_eq!(config.max_attempts, 10);
        assert!((config.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn delays_double_until_cap() {
        let mut policy = ReconnectPolicy::new(fixed(1_000, 30_000, 0));

        let delays: Vec<u128> = (0..7)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();

        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut policy = ReconnectPolicy::new(fixed(100, 1_000, 3));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.attempt_count(), 3);

        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut policy = ReconnectPolicy::new(fixed(100, 10_000, 3));

        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig::default());

            let millis = policy.next_delay().unwrap().as_millis();

            assert!(millis >= 800, "delay {millis}ms is below minimum 800ms");
            assert!(millis <= 1_200, "delay {millis}ms is above maximum 1200ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_budget_is_enforced() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            max_elapsed: Duration::from_secs(5),
            ..fixed(1_000, 30_000, 0)
        });

        assert!(policy.next_delay().is_some());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(policy.next_delay().is_some());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(policy.next_delay().is_none());

        policy.reset();
        assert!(policy.next_delay().is_some());
    }

    #[test]
    fn zero_budgets_never_give_up() {
        let mut policy = ReconnectPolicy::new(fixed(10, 20, 0));

        assert!((0..500).all(|_| policy.next_delay().is_some()));
        assert_eq!(policy.attempt_count(), 500);
    }
}
