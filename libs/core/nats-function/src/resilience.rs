//! Reconnect pacing.
//!
//! This module provides:
//! - **ReconnectPolicy**: delay between connection attempts, optional
//!   exponential backoff and an optional attempt cap
//! - **Circuit Breaker**: stops dialling for a cool-down period after a run
//!   of consecutive failures, so a flapping server is not hammered
//!
//! ## Circuit Breaker States
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ cool-down elapsed
//!      │                                   v
//!      │      success            ┌─────────────┐
//!      └──────────────────────── │ HALF-OPEN   │
//!                                └─────────────┘
//!                                      │
//!                       failure        │
//!                       ───────────────┘ (back to OPEN)
//! ```

use std::time::Duration;
use tokio::time::Instant;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Exponential growth of the reconnect delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Factor applied per failed attempt
    pub multiplier: u32,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

/// How the connection manager paces reconnect attempts.
///
/// The default is a fixed 5 second delay with no attempt limit, so the loop
/// runs until it succeeds or the process exits.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Base delay after a failed attempt
    pub interval: Duration,
    /// Optional exponential backoff on top of `interval`
    pub backoff: Option<Backoff>,
    /// Give up after this many consecutive failures (None = never)
    pub max_attempts: Option<u32>,
    /// Optional circuit breaker against reconnection storms
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_INTERVAL)
    }
}

impl ReconnectPolicy {
    /// Fixed delay, unlimited attempts.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff: None,
            max_attempts: None,
            circuit_breaker: None,
        }
    }

    /// Enable exponential backoff.
    pub fn with_backoff(mut self, multiplier: u32, max_delay: Duration) -> Self {
        self.backoff = Some(Backoff {
            multiplier: multiplier.max(1),
            max_delay,
        });
        self
    }

    /// Cap the number of consecutive attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Enable the circuit breaker.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.backoff {
            None => self.interval,
            Some(backoff) => {
                let exponent = attempt.saturating_sub(1);
                let factor = backoff.multiplier.saturating_pow(exponent);
                self.interval
                    .saturating_mul(factor)
                    .min(backoff.max_delay.max(self.interval))
            }
        }
    }

    /// Whether `attempt` consecutive failures exhaust the policy.
    pub fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempt >= max)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Attempts flow normally.
    Closed,
    /// Attempts are held back until the cool-down elapses.
    Open,
    /// One probe attempt is allowed.
    HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before probing again.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cool-down period.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Circuit breaker owned by a single reconnect loop.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Get the consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Check whether an attempt may be made now.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.remaining_cooldown().is_zero() {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left before an open circuit allows a probe.
    pub fn remaining_cooldown(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.cooldown.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!("Reconnect circuit CLOSED (recovered)");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        match self.state {
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.transition_to_open();
            }
            CircuitState::HalfOpen => self.transition_to_open(),
            _ => {}
        }
    }

    fn transition_to_open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        tracing::warn!(
            failures = self.failure_count,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Reconnect circuit OPENED"
        );
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        tracing::info!("Reconnect circuit HALF-OPEN (probing)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_fixed_five_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(100), Duration::from_secs(5));
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(1))
            .with_backoff(2, Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(64), Duration::from_secs(10));
    }

    #[test]
    fn test_max_attempts() {
        let policy = ReconnectPolicy::default().with_max_attempts(3);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_opens_and_recovers() {
        let mut breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_secs(30)),
        );

        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.remaining_cooldown(), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // A failed probe reopens the circuit
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
