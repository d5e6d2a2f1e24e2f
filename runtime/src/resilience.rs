//! Circuit-breaker command wrapper with fallback.
//!
//! A [`CircuitBreakerProcessor`] runs every invocation as a
//! [`ResilienceCommand`] on its own tokio task. The exchange is moved into the
//! task and handed back through a oneshot channel, so exactly one party owns
//! it at any time and completion is signalled exactly once.
//!
//! # Invocation
//!
//! 1. The breaker is asked for permission. An open circuit synthesises a
//!    [`RoutingError::CircuitOpen`] failure and goes straight to the fallback.
//! 2. [`ResilienceCommand::run`] invokes the guarded processor inside a try
//!    block, so the route's error handler stays out of the way. With an
//!    optional execution timeout, an expired run synthesises
//!    [`RoutingError::CommandTimeout`].
//! 3. A failed run is recorded on the breaker and handed to
//!    [`ResilienceCommand::get_fallback`].
//!
//! # Example
//!
//! ```
//! use conduit_core::prelude::*;
//! use conduit_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use conduit_runtime::resilience::CircuitBreakerProcessor;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let guarded = processor_fn("inventory", |_| Err(Failure::msg("connection refused")));
//! let fallback = processor_fn("cached", |exchange| {
//!     exchange.set_body(json!("cached stock"));
//!     Ok(())
//! });
//! let breaker = CircuitBreaker::new("inventory", CircuitBreakerConfig::default());
//! let step = CircuitBreakerProcessor::new("inventory", guarded, breaker).with_fallback(fallback);
//!
//! let mut exchange = Exchange::new();
//! step.process(&mut exchange).await.unwrap();
//!
//! assert!(!exchange.is_failed());
//! assert_eq!(exchange.body(), &json!("cached stock"));
//! assert_eq!(exchange.exception_caught().unwrap().to_string(), "connection refused");
//! # }
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::error::RoutingError;
use crate::scheduler::capture;
use conduit_core::exchange::property;
use conduit_core::processor::ProcessFuture;
use conduit_core::{ConfigError, Exchange, Failure, Processor, SharedProcessor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// One guarded invocation: the processor, its fallback and the fallback policy.
pub struct ResilienceCommand {
    processor: SharedProcessor,
    fallback: Option<SharedProcessor>,
    fallback_enabled: Option<bool>,
}

impl ResilienceCommand {
    /// Guard `processor`, without a fallback.
    #[must_use]
    pub fn new(processor: SharedProcessor) -> Self {
        Self {
            processor,
            fallback: None,
            fallback_enabled: None,
        }
    }

    /// Run `fallback` when the guarded processor fails.
    #[must_use]
    pub fn with_fallback(mut self, fallback: SharedProcessor) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Set the fallback-enabled flag.
    ///
    /// `Some(false)` treats every run as successful from the breaker's point
    /// of view; the failure stays on the exchange.
    #[must_use]
    pub const fn with_fallback_enabled(mut self, enabled: Option<bool>) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Invoke the guarded processor.
    ///
    /// The try-route-block marker is set before the call. When the run counts
    /// as successful the marker is removed here; otherwise it is left for
    /// [`get_fallback`](Self::get_fallback).
    ///
    /// # Errors
    ///
    /// Re-raises the captured failure when the fallback flag is unset, or set
    /// and the exchange failed, so the breaker records a failed call.
    pub async fn run(&self, exchange: &mut Exchange) -> Result<(), Failure> {
        tracing::debug!(
            exchange_id = %exchange.id(),
            processor = self.processor.name(),
            "Running guarded processor"
        );
        exchange.set_property(property::TRY_ROUTE_BLOCK, true);
        capture(self.processor.as_ref(), exchange).await;

        if self.fallback_enabled.is_none_or(|enabled| enabled) {
            if let Some(failure) = exchange.failure() {
                return Err(failure.clone());
            }
        }

        exchange.remove_property(property::TRY_ROUTE_BLOCK);
        Ok(())
    }

    /// Recover a failed run.
    ///
    /// Without a failure the exchange passes through untouched. Otherwise,
    /// when a fallback is configured, the failure moves to the
    /// exception-caught slot and the fallback runs on a clean exchange. The
    /// try-route-block marker is removed on every path.
    pub async fn get_fallback(&self, exchange: &mut Exchange) {
        if let (Some(fallback), Some(failure)) = (&self.fallback, exchange.failure().cloned()) {
            tracing::debug!(
                exchange_id = %exchange.id(),
                fallback = fallback.name(),
                error = %failure,
                "Error occurred processing, running fallback"
            );

            if !exchange.has_property(property::FAILURE_ENDPOINT) {
                let endpoint = exchange.property(property::TO_ENDPOINT).cloned();
                exchange.replace_property(property::FAILURE_ENDPOINT, endpoint);
            }
            exchange.set_property(property::EXCEPTION_HANDLED, true);
            exchange.set_exception_caught(Some(failure));
            exchange.clear_failure();

            metrics::counter!("conduit_resilience_fallbacks_total").increment(1);
            capture(fallback.as_ref(), exchange).await;
        }

        exchange.remove_property(property::TRY_ROUTE_BLOCK);
    }

    /// Full invocation under `breaker`, with an optional execution timeout.
    pub async fn execute(&self, breaker: &CircuitBreaker, timeout: Option<Duration>, exchange: &mut Exchange) {
        if let Err(rejected) = breaker.try_acquire() {
            exchange.set_failure(rejected.into());
            self.get_fallback(exchange).await;
            return;
        }

        let outcome = match timeout {
            Some(limit) => {
                // An expired run is dropped mid-flight and may leave the exchange
                // checked out by a nested step, so recovery starts from this copy.
                let snapshot = exchange.clone();
                match tokio::time::timeout(limit, self.run(exchange)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        *exchange = snapshot;
                        metrics::counter!("conduit_resilience_timeouts_total").increment(1);
                        tracing::warn!(
                            exchange_id = %exchange.id(),
                            breaker = breaker.name(),
                            timeout_ms = limit.as_millis(),
                            "Guarded processor timed out"
                        );
                        Err(Failure::from(RoutingError::CommandTimeout {
                            name: breaker.name().to_string(),
                            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        }))
                    },
                }
            },
            None => self.run(exchange).await,
        };

        match outcome {
            Ok(()) => breaker.record_success(),
            Err(failure) => {
                breaker.record_failure();
                exchange.set_failure(failure);
                self.get_fallback(exchange).await;
            },
        }
    }
}

/// Runs a processor under a circuit breaker, on a separate task.
pub struct CircuitBreakerProcessor {
    id: String,
    command: Arc<ResilienceCommand>,
    breaker: CircuitBreaker,
    timeout: Option<Duration>,
}

impl CircuitBreakerProcessor {
    /// Guard `processor` with `breaker`.
    #[must_use]
    pub fn new(id: impl Into<String>, processor: SharedProcessor, breaker: CircuitBreaker) -> Self {
        Self {
            id: id.into(),
            command: Arc::new(ResilienceCommand::new(processor)),
            breaker,
            timeout: None,
        }
    }

    fn map_command(mut self, f: impl FnOnce(ResilienceCommand) -> ResilienceCommand) -> Self {
        let command = match Arc::try_unwrap(self.command) {
            Ok(command) => command,
            Err(shared) => ResilienceCommand {
                processor: Arc::clone(&shared.processor),
                fallback: shared.fallback.clone(),
                fallback_enabled: shared.fallback_enabled,
            },
        };
        self.command = Arc::new(f(command));
        self
    }

    /// Run `fallback` when the guarded processor fails or the circuit is open.
    #[must_use]
    pub fn with_fallback(self, fallback: SharedProcessor) -> Self {
        self.map_command(|command| command.with_fallback(fallback))
    }

    /// Set the fallback-enabled flag.
    #[must_use]
    pub fn with_fallback_enabled(self, enabled: Option<bool>) -> Self {
        self.map_command(|command| command.with_fallback_enabled(enabled))
    }

    /// Fail runs that take longer than `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The breaker guarding this processor.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl Processor for CircuitBreakerProcessor {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            let checked_out = std::mem::take(exchange);
            let (done, completed) = oneshot::channel();
            let command = Arc::clone(&self.command);
            let breaker = self.breaker.clone();
            let timeout = self.timeout;

            tokio::spawn(async move {
                let mut exchange = checked_out;
                command.execute(&breaker, timeout, &mut exchange).await;
                let _ = done.send(exchange);
            });

            // A closed channel means the task was dropped with the exchange,
            // e.g. during runtime shutdown. The message cannot be recovered.
            match completed.await {
                Ok(returned) => *exchange = returned,
                Err(_) => exchange.set_failure(Failure::from(RoutingError::CommandAborted {
                    name: self.id.clone(),
                })),
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn start(&self) -> Result<(), ConfigError> {
        self.command.processor.start()?;
        if let Some(fallback) = &self.command.fallback {
            fallback.start()?;
        }
        Ok(())
    }

    fn stop(&self) {
        if let Some(fallback) = &self.command.fallback {
            fallback.stop();
        }
        self.command.processor.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use conduit_core::processor::processor_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .timeout(Duration::from_secs(60))
                .build(),
        )
    }

    fn failing() -> SharedProcessor {
        processor_fn("failing", |_| Err(Failure::msg("boom")))
    }

    fn fallback(calls: &Arc<AtomicUsize>) -> SharedProcessor {
        let calls = Arc::clone(calls);
        processor_fn("fallback", move |exchange| {
            calls.fetch_add(1, Ordering::SeqCst);
            exchange.set_body(json!("fallback"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let step = CircuitBreakerProcessor::new(
            "ok",
            processor_fn("ok", |exchange| {
                assert!(exchange.in_try_block());
                exchange.set_body(json!("done"));
                Ok(())
            }),
            breaker(1),
        );
        let mut exchange = Exchange::with_body(json!("in"));
        let id = exchange.id().clone();

        step.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.id(), &id);
        assert_eq!(exchange.body(), &json!("done"));
        assert!(!exchange.has_property(property::TRY_ROUTE_BLOCK));
        assert_eq!(step.breaker().metrics().total_successes, 1);
    }

    #[tokio::test]
    async fn test_failure_runs_fallback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = CircuitBreakerProcessor::new("cb", failing(), breaker(5)).with_fallback(fallback(&calls));
        let mut exchange = Exchange::new();
        exchange.set_property(property::TO_ENDPOINT, "mock:inventory");

        step.process(&mut exchange).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!exchange.is_failed());
        assert_eq!(exchange.body(), &json!("fallback"));
        assert_eq!(exchange.exception_caught().unwrap().to_string(), "boom");
        assert!(exchange.property_flag(property::EXCEPTION_HANDLED));
        assert_eq!(exchange.property(property::FAILURE_ENDPOINT), Some(&json!("mock:inventory")));
        assert!(!exchange.has_property(property::TRY_ROUTE_BLOCK));
        assert_eq!(step.breaker().metrics().total_failures, 1);
    }

    #[tokio::test]
    async fn test_failure_endpoint_set_only_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = CircuitBreakerProcessor::new("cb", failing(), breaker(5)).with_fallback(fallback(&calls));
        let mut exchange = Exchange::new();
        exchange.set_property(property::TO_ENDPOINT, "mock:first");

        step.process(&mut exchange).await.unwrap();
        exchange.set_property(property::TO_ENDPOINT, "mock:second");
        step.process(&mut exchange).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exchange.property(property::FAILURE_ENDPOINT), Some(&json!("mock:first")));
    }

    #[tokio::test]
    async fn test_without_fallback_failure_stays() {
        let step = CircuitBreakerProcessor::new("cb", failing(), breaker(5));
        let mut exchange = Exchange::new();

        step.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.failure().unwrap().to_string(), "boom");
        assert!(exchange.exception_caught().is_none());
        assert!(!exchange.has_property(property::TRY_ROUTE_BLOCK));
    }

    #[tokio::test]
    async fn test_fallback_disabled_counts_as_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = CircuitBreakerProcessor::new("cb", failing(), breaker(1))
            .with_fallback(fallback(&calls))
            .with_fallback_enabled(Some(false));
        let mut exchange = Exchange::new();

        step.process(&mut exchange).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(exchange.is_failed());
        assert_eq!(step.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_goes_to_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        let guarded = processor_fn("guarded", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Failure::msg("down"))
        });
        let step = CircuitBreakerProcessor::new("cb", guarded, breaker(1)).with_fallback(fallback(&calls));

        let mut first = Exchange::new();
        step.process(&mut first).await.unwrap();
        let mut second = Exchange::new();
        step.process(&mut second).await.unwrap();

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let caught = second.exception_caught().unwrap();
        assert!(matches!(caught.downcast_ref::<RoutingError>(), Some(RoutingError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_timeout_synthesises_failure() {
        let slow = conduit_testing::DelayProcessor::new("slow", Duration::from_millis(200));
        let step = CircuitBreakerProcessor::new("cb", Arc::new(slow), breaker(5))
            .with_timeout(Duration::from_millis(20));
        let mut exchange = Exchange::new();

        step.process(&mut exchange).await.unwrap();

        let failure = exchange.failure().unwrap();
        assert!(matches!(
            failure.downcast_ref::<RoutingError>(),
            Some(RoutingError::CommandTimeout { timeout_ms: 20, .. })
        ));
        assert!(!exchange.has_property(property::TRY_ROUTE_BLOCK));
    }

    #[tokio::test]
    async fn test_outer_timeout_keeps_exchange_checked_out_by_inner_breaker() {
        let slow = conduit_testing::DelayProcessor::new("slow", Duration::from_millis(200));
        let inner: SharedProcessor = Arc::new(CircuitBreakerProcessor::new("inner", Arc::new(slow), breaker(5)));
        let seen = Arc::new(std::sync::Mutex::new(None));
        let recorder = Arc::clone(&seen);
        let outer = CircuitBreakerProcessor::new("outer", inner, breaker(5))
            .with_timeout(Duration::from_millis(20))
            .with_fallback(processor_fn("fallback", move |exchange| {
                *recorder.lock().unwrap() = Some((exchange.id().clone(), exchange.body().clone()));
                exchange.set_body(json!("fallback"));
                Ok(())
            }));
        let mut exchange = Exchange::with_body(json!("order-42"));
        exchange.message_mut().set_header("tenant", "acme");
        let id = exchange.id().clone();

        outer.process(&mut exchange).await.unwrap();

        assert_eq!(seen.lock().unwrap().clone(), Some((id.clone(), json!("order-42"))));
        assert_eq!(exchange.id(), &id);
        assert_eq!(exchange.body(), &json!("fallback"));
        assert_eq!(exchange.header("tenant"), Some(&json!("acme")));
        assert!(matches!(
            exchange.exception_caught().unwrap().downcast_ref::<RoutingError>(),
            Some(RoutingError::CommandTimeout { timeout_ms: 20, .. })
        ));
        assert!(!exchange.has_property(property::TRY_ROUTE_BLOCK));
    }

    #[tokio::test]
    async fn test_fallback_failure_is_captured() {
        let step = CircuitBreakerProcessor::new("cb", failing(), breaker(5))
            .with_fallback(processor_fn("broken fallback", |_| Err(Failure::msg("fallback failed"))));
        let mut exchange = Exchange::new();

        step.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.failure().unwrap().to_string(), "fallback failed");
        assert_eq!(exchange.exception_caught().unwrap().to_string(), "boom");
        assert!(!exchange.has_property(property::TRY_ROUTE_BLOCK));
    }
}
