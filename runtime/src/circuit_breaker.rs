//! Circuit breaker for guarding processors.
//!
//! A circuit breaker counts failed invocations and "opens" when they exceed a
//! threshold, so further calls are rejected at once instead of piling onto a
//! failing downstream.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Failures are counted.
//! - **Open**: Too many failures detected. Calls are rejected for `timeout`.
//! - **HalfOpen**: After the timeout, calls are let through to test recovery.
//!
//! # State Transitions
//!
//! - `Closed` → `Open`: after `failure_threshold` consecutive failures
//! - `Open` → `HalfOpen`: once `timeout` has elapsed
//! - `HalfOpen` → `Closed`: after `success_threshold` consecutive successes
//! - `HalfOpen` → `Open`: on any failure
//!
//! Breakers are shared by name through the [`CircuitBreakerRegistry`], so all
//! routes guarding the same downstream see the same state.
//!
//! # Example
//!
//! ```
//! use conduit_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(2)
//!     .timeout(Duration::from_secs(30))
//!     .build();
//! let breaker = CircuitBreaker::new("inventory", config);
//!
//! breaker.record_failure();
//! breaker.record_failure();
//!
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(breaker.try_acquire().is_err());
//! ```

use crate::error::RoutingError;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Duration to wait before transitioning from Open to `HalfOpen`
    pub timeout: Duration,
    /// Number of successes in `HalfOpen` state before closing the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the success threshold for closing from `HalfOpen`.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - normal operation, calls pass through
    Closed,

    /// Circuit is open - failing fast, rejecting calls immediately
    Open,

    /// Circuit is half-open - testing if the downstream recovered
    HalfOpen,
}

impl CircuitState {
    const fn as_label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    epoch: Instant,
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    /// Nanoseconds since `epoch` at which the circuit last opened
    opened_at: AtomicU64,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

/// A named circuit breaker. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                epoch: Instant::now(),
                state: AtomicU8::new(CircuitState::Closed as u8),
                failure_count: AtomicUsize::new(0),
                success_count: AtomicUsize::new(0),
                opened_at: AtomicU64::new(0),
                total_calls: AtomicU64::new(0),
                total_successes: AtomicU64::new(0),
                total_failures: AtomicU64::new(0),
                total_rejections: AtomicU64::new(0),
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.shared.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .shared
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            if to == CircuitState::Open {
                self.shared.opened_at.store(self.now_nanos(), Ordering::Release);
            }
            metrics::counter!(
                "conduit_circuit_breaker_state_changes_total",
                "breaker" => self.shared.name.clone(),
                "from" => from.as_label(),
                "to" => to.as_label()
            )
            .increment(1);
            tracing::info!(
                breaker = %self.shared.name,
                from = from.as_label(),
                to = to.as_label(),
                "Circuit breaker state change"
            );
        }
        swapped
    }

    /// Ask permission for a call.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::CircuitOpen`] while the circuit is open and the
    /// open timeout has not elapsed.
    pub fn try_acquire(&self) -> Result<(), RoutingError> {
        self.shared.total_calls.fetch_add(1, Ordering::Relaxed);

        if self.state() == CircuitState::Open {
            let opened_at = self.shared.opened_at.load(Ordering::Acquire);
            let elapsed = Duration::from_nanos(self.now_nanos().saturating_sub(opened_at));

            if elapsed < self.shared.config.timeout {
                self.shared.total_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(breaker = %self.shared.name, "Circuit breaker rejected call");
                return Err(RoutingError::CircuitOpen {
                    name: self.shared.name.clone(),
                });
            }
            if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                self.shared.success_count.store(0, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.shared.total_successes.fetch_add(1, Ordering::Relaxed);

        match self.state() {
            CircuitState::Closed => {
                self.shared.failure_count.store(0, Ordering::Release);
            },
            CircuitState::HalfOpen => {
                let successes = self.shared.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.shared.config.success_threshold
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    self.shared.failure_count.store(0, Ordering::Release);
                    self.shared.success_count.store(0, Ordering::Release);
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.shared.total_failures.fetch_add(1, Ordering::Relaxed);

        match self.state() {
            CircuitState::Closed => {
                let failures = self.shared.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.shared.config.failure_threshold
                    && self.transition(CircuitState::Closed, CircuitState::Open)
                {
                    tracing::warn!(
                        breaker = %self.shared.name,
                        failures,
                        threshold = self.shared.config.failure_threshold,
                        "Circuit breaker opening due to failures"
                    );
                }
            },
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.shared.success_count.store(0, Ordering::Release);
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        self.shared.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.shared.failure_count.store(0, Ordering::Release);
        self.shared.success_count.store(0, Ordering::Release);
        tracing::info!(breaker = %self.shared.name, "Circuit breaker manually reset to closed");
    }

    /// Call counters.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.shared.total_calls.load(Ordering::Relaxed),
            total_successes: self.shared.total_successes.load(Ordering::Relaxed),
            total_failures: self.shared.total_failures.load(Ordering::Relaxed),
            total_rejections: self.shared.total_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

/// Breakers shared by name.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose new breakers use `defaults`.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            defaults,
        }
    }

    /// The breaker named `name`, created with the default configuration if new.
    #[must_use]
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        self.get_or_create_with(name, &self.defaults)
    }

    /// The breaker named `name`, created with `config` if new.
    #[must_use]
    pub fn get_or_create_with(&self, name: &str, config: &CircuitBreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config.clone()))
            .clone()
    }

    /// Look up an existing breaker.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// Names of breakers currently open.
    #[must_use]
    pub fn open_breakers(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() == CircuitState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: usize, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(failures)
                .timeout(timeout)
                .success_threshold(2)
                .build(),
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Err(RoutingError::CircuitOpen { .. })));
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(2, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_successes() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.try_acquire().unwrap();

        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_registry_shares_breakers_by_name() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::builder().failure_threshold(1).build());

        let a = registry.get_or_create("inventory");
        let b = registry.get_or_create("inventory");
        a.record_failure();

        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(registry.open_breakers(), vec!["inventory".to_string()]);
        assert!(registry.get("billing").is_none());
    }

    #[test]
    fn test_reset_closes_circuit() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.record_failure();

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.try_acquire().unwrap();
    }
}
