//! Retry Policies
//!
//! Delay policies consulted by the stream controller between connection
//! attempts: exponential backoff with jitter (the default) or a fixed
//! delay. Both can cap the number of consecutive attempts.

use std::fmt;
use std::time::Duration;

use rand::Rng;

/// Produces the delay before the next connection attempt.
pub trait RetryPolicy: Send + fmt::Debug {
    /// Delay before the next attempt, or `None` when the budget is spent.
    fn next_delay(&mut self) -> Option<Duration>;

    /// Forget previous failures after a successful attempt.
    fn reset(&mut self);

    /// Attempts made since the last reset.
    fn attempt_count(&self) -> u32;
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Configuration for exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0, // Unlimited
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `StreamSettings`.
    #[must_use]
    pub const fn from_stream_settings(settings: &crate::StreamSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: settings.reconnect_jitter,
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use binance_stream::application::services::retry::{ReconnectConfig, ReconnectPolicy, RetryPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// // Get delay for first attempt
/// assert!(policy.next_delay().is_some());
///
/// // Simulate successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn grow(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

impl RetryPolicy for ReconnectPolicy {
    fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.apply_jitter(self.current_delay);
        self.grow();
        Some(delay)
    }

    fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    fn attempt_count(&self) -> u32 {
        self.attempt_count
    }
}

// =============================================================================
// Fixed Delay
// =============================================================================

/// The same delay before every attempt.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
    attempt_count: u32,
}

impl FixedDelay {
    /// Create a fixed-delay policy (`max_attempts` 0 = unlimited).
    #[must_use]
    pub const fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempt_count: 0,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempt_count >= self.max_attempts {
            return None;
        }
        self.attempt_count += 1;
        Some(self.delay)
    }

    fn reset(&mut self) {
        self.attempt_count = 0;
    }

    fn attempt_count(&self) -> u32 {
        self.attempt_count
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Which policy a controller builds for each run.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Exponential backoff with jitter.
    Exponential(ReconnectConfig),
    /// Fixed delay between attempts.
    Fixed {
        /// Delay before every attempt.
        delay: Duration,
        /// Maximum consecutive attempts (0 = unlimited).
        max_attempts: u32,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential(ReconnectConfig::default())
    }
}

impl RetryStrategy {
    /// Build a fresh policy.
    #[must_use]
    pub fn build(&self) -> Box<dyn RetryPolicy> {
        match self {
            Self::Exponential(config) => Box::new(ReconnectPolicy::new(config.clone())),
            Self::Fixed {
                delay,
                max_attempts,
            } => Box::new(FixedDelay::new(*delay, *max_attempts)),
        }
    }

    /// Delay before reconnecting after a clean close.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        match self {
            Self::Exponential(config) => config.initial_delay,
            Self::Fixed { delay, .. } => *delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0, // No jitter for predictable testing
            max_attempts,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 0);
    }

    #[test]
    fn policy_exponential_backoff() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));

        let delays: Vec<u128> = (0..4)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn policy_max_delay_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(2000),
            multiplier: 4.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        });

        let _ = policy.next_delay();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn policy_max_attempts() {
        let mut policy = ReconnectPolicy::new(no_jitter(3));

        for expected in 1..=3 {
            assert!(policy.next_delay().is_some());
            assert_eq!(policy.attempt_count(), expected);
        }

        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn policy_reset() {
        let mut policy = ReconnectPolicy::new(no_jitter(3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..no_jitter(0)
            });

            let millis = policy.next_delay().unwrap().as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test_case(0, 50 ; "unlimited")]
    #[test_case(2, 2 ; "capped")]
    fn fixed_delay_attempts(max_attempts: u32, expected_some: usize) {
        let mut policy = FixedDelay::new(Duration::from_millis(250), max_attempts);

        let delays: Vec<_> = (0..50).map_while(|_| policy.next_delay()).collect();

        assert_eq!(delays.len(), expected_some);
        assert!(delays.iter().all(|d| *d == Duration::from_millis(250)));
    }

    #[test]
    fn strategy_builds_matching_policy() {
        let mut fixed = RetryStrategy::Fixed {
            delay: Duration::from_secs(1),
            max_attempts: 0,
        }
        .build();
        assert_eq!(fixed.next_delay(), Some(Duration::from_secs(1)));

        let strategy = RetryStrategy::Exponential(no_jitter(0));
        let mut exponential = strategy.build();
        let _ = exponential.next_delay();
        assert_eq!(exponential.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(strategy.initial_delay(), Duration::from_millis(100));
    }
}
