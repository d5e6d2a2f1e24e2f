//! Error handling with redelivery.
//!
//! An [`ErrorHandler`] decorates each step of a route. When the step leaves a
//! failure on the exchange, the handler:
//!
//! 1. does nothing if the exchange is inside a try block (the enclosing
//!    scope, such as a resilience command, owns the failure)
//! 2. redelivers with back-off while the [`RedeliveryPolicy`] allows it
//! 3. once exhausted, records the failure endpoint and caught exception, then
//!    applies the first matching [`OnException`] clause, or the dead letter
//!    channel, or leaves the failure in place
//!
//! # Example
//!
//! ```
//! use conduit_runtime::error_handler::{ErrorHandler, OnException, RedeliveryPolicy};
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("invalid order")]
//! struct InvalidOrder;
//!
//! let handler = ErrorHandler::new()
//!     .with_redelivery(
//!         RedeliveryPolicy::new()
//!             .with_max_redeliveries(3)
//!             .with_initial_delay(Duration::from_millis(100)),
//!     )
//!     .on_exception(OnException::of::<InvalidOrder>().handled(true));
//! # let _ = handler;
//! ```

use crate::dead_letter::DeadLetterQueue;
use crate::scheduler::capture;
use conduit_core::exchange::{header, property};
use conduit_core::expression::Predicate;
use conduit_core::processor::ProcessFuture;
use conduit_core::{ConfigError, Exchange, Failure, Processor, SharedProcessor};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Redelivery policy with exponential back-off.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Redelivery attempts after the first failure (0 disables redelivery)
    max_redeliveries: u32,

    /// Delay before the first redelivery
    initial_delay: Duration,

    /// Maximum delay between redeliveries (caps exponential backoff)
    max_delay: Duration,

    /// Multiplier for exponential backoff (1.0 = constant delay)
    backoff_multiplier: f64,

    /// Randomise each delay between 50% and 100%
    jitter: bool,
}

impl RedeliveryPolicy {
    /// Create a policy with default settings
    ///
    /// Defaults:
    /// - `max_redeliveries`: 0
    /// - `initial_delay`: 1 second
    /// - `max_delay`: 60 seconds
    /// - `backoff_multiplier`: 1.0 (constant)
    /// - `jitter`: off
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_redeliveries: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Set maximum redeliveries
    #[must_use]
    pub const fn with_max_redeliveries(mut self, redeliveries: u32) -> Self {
        self.max_redeliveries = redeliveries;
        self
    }

    /// Set delay before first redelivery
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between redeliveries
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before redelivery number `attempt` (0-indexed)
    ///
    /// `delay = min(initial_delay * multiplier^attempt, max_delay)`, scaled by a
    /// random factor in `[0.5, 1.0]` when jitter is on.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            capped_secs * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs.max(0.0))
    }

    /// Maximum redeliveries
    #[must_use]
    pub const fn max_redeliveries(&self) -> u32 {
        self.max_redeliveries
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

type FailureMatcher = Arc<dyn Fn(&Failure) -> bool + Send + Sync>;

/// Handling rule for a kind of failure.
#[derive(Clone)]
pub struct OnException {
    description: String,
    matcher: FailureMatcher,
    when: Option<Predicate>,
    handled: bool,
    processor: Option<SharedProcessor>,
    max_redeliveries: Option<u32>,
}

impl OnException {
    /// Match failures whose error is of type `E`.
    #[must_use]
    pub fn of<E>() -> Self
    where
        E: StdError + 'static,
    {
        Self::matching(std::any::type_name::<E>(), |failure| failure.is::<E>())
    }

    /// Match failures with a custom test.
    #[must_use]
    pub fn matching<F>(description: impl Into<String>, matcher: F) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            matcher: Arc::new(matcher),
            when: None,
            handled: false,
            processor: None,
            max_redeliveries: None,
        }
    }

    /// Additionally require `predicate` to hold for the exchange.
    #[must_use]
    pub fn on_when(mut self, predicate: Predicate) -> Self {
        self.when = Some(predicate);
        self
    }

    /// Clear the failure after handling.
    #[must_use]
    pub const fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    /// Run `processor` once redelivery is exhausted.
    #[must_use]
    pub fn to(mut self, processor: SharedProcessor) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Override the handler's redelivery count for matching failures.
    #[must_use]
    pub const fn maximum_redeliveries(mut self, redeliveries: u32) -> Self {
        self.max_redeliveries = Some(redeliveries);
        self
    }

    fn matches(&self, failure: &Failure, exchange: &Exchange) -> bool {
        (self.matcher)(failure) && self.when.as_ref().is_none_or(|p| p.matches(exchange))
    }
}

impl fmt::Debug for OnException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnException")
            .field("exception", &self.description)
            .field("handled", &self.handled)
            .field("max_redeliveries", &self.max_redeliveries)
            .finish_non_exhaustive()
    }
}

/// Where exhausted exchanges go when no clause matches.
#[derive(Clone, Default)]
struct DeadLetterChannel {
    queue: Option<DeadLetterQueue>,
    processor: Option<SharedProcessor>,
}

/// Error handler configuration shared by the steps of a route.
#[derive(Clone, Default)]
pub struct ErrorHandler {
    policy: RedeliveryPolicy,
    clauses: Vec<OnException>,
    dead_letter: Option<DeadLetterChannel>,
}

impl ErrorHandler {
    /// The default error handler: no redelivery, failures stay on the exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A dead letter channel error handler storing exhausted exchanges in `queue`.
    #[must_use]
    pub fn dead_letter_channel(queue: DeadLetterQueue) -> Self {
        Self {
            dead_letter: Some(DeadLetterChannel {
                queue: Some(queue),
                processor: None,
            }),
            ..Self::default()
        }
    }

    /// Also send dead letters to `processor`.
    #[must_use]
    pub fn with_dead_letter_processor(mut self, processor: SharedProcessor) -> Self {
        self.dead_letter.get_or_insert_with(DeadLetterChannel::default).processor = Some(processor);
        self
    }

    /// Set the redelivery policy.
    #[must_use]
    pub fn with_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add an exception clause. Clauses are tried in order.
    #[must_use]
    pub fn on_exception(mut self, clause: OnException) -> Self {
        self.clauses.push(clause);
        self
    }

    /// The redelivery policy.
    #[must_use]
    pub const fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Decorate `processor` with this error handler.
    #[must_use]
    pub fn wrap(&self, processor: SharedProcessor) -> SharedProcessor {
        Arc::new(ErrorHandlerProcessor {
            handler: self.clone(),
            processor,
        })
    }

    fn clause_for(&self, failure: &Failure, exchange: &Exchange) -> Option<&OnException> {
        self.clauses.iter().find(|clause| clause.matches(failure, exchange))
    }

    async fn handle_exhausted(&self, exchange: &mut Exchange, redeliveries: u32) {
        let Some(failure) = exchange.failure().cloned() else {
            return;
        };

        if !exchange.has_property(property::FAILURE_ENDPOINT) {
            exchange.replace_property(
                property::FAILURE_ENDPOINT,
                exchange.property(property::TO_ENDPOINT).cloned(),
            );
        }
        exchange.set_exception_caught(Some(failure.clone()));

        metrics::counter!("conduit_redelivery_exhausted_total").increment(1);
        tracing::warn!(
            exchange_id = %exchange.id(),
            redeliveries,
            error = %failure,
            "Redelivery exhausted"
        );

        if let Some(clause) = self.clause_for(&failure, exchange).cloned() {
            self.apply_clause(&clause, exchange, failure).await;
        } else if let Some(channel) = &self.dead_letter {
            exchange.set_property(property::REDELIVERY_EXHAUSTED, true);
            if let Some(queue) = &channel.queue {
                queue.push(exchange.clone(), redeliveries);
            }
            exchange.clear_failure();
            if let Some(processor) = &channel.processor {
                capture(processor.as_ref(), exchange).await;
            }
            exchange.set_property(property::EXCEPTION_HANDLED, true);
            exchange.set_error_handler_handled(Some(true));
        } else {
            exchange.set_property(property::REDELIVERY_EXHAUSTED, true);
            exchange.set_error_handler_handled(Some(false));
        }
    }

    async fn apply_clause(&self, clause: &OnException, exchange: &mut Exchange, failure: Failure) {
        tracing::debug!(exchange_id = %exchange.id(), clause = %clause.description, "Applying exception clause");
        exchange.clear_failure();

        if let Some(processor) = &clause.processor {
            capture(processor.as_ref(), exchange).await;
            if exchange.is_failed() {
                exchange.set_error_handler_handled(Some(false));
                return;
            }
        }

        if clause.handled {
            exchange.set_property(property::EXCEPTION_HANDLED, true);
            exchange.set_error_handler_handled(Some(true));
        } else {
            exchange.set_failure(failure);
            exchange.set_property(property::REDELIVERY_EXHAUSTED, true);
            exchange.set_error_handler_handled(Some(false));
        }
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("policy", &self.policy)
            .field("clauses", &self.clauses)
            .field("dead_letter", &self.dead_letter.is_some())
            .finish()
    }
}

/// A processor decorated with an [`ErrorHandler`].
struct ErrorHandlerProcessor {
    handler: ErrorHandler,
    processor: SharedProcessor,
}

impl Processor for ErrorHandlerProcessor {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            let mut redeliveries = 0;
            loop {
                capture(self.processor.as_ref(), exchange).await;

                let Some(failure) = exchange.failure().cloned() else {
                    return Ok(());
                };
                if exchange.in_try_block() {
                    return Ok(());
                }

                let allowed = self
                    .handler
                    .clause_for(&failure, exchange)
                    .and_then(|clause| clause.max_redeliveries)
                    .unwrap_or(self.handler.policy.max_redeliveries);
                if redeliveries >= allowed {
                    self.handler.handle_exhausted(exchange, redeliveries).await;
                    return Ok(());
                }

                let delay = self.handler.policy.delay_for_attempt(redeliveries);
                redeliveries += 1;
                metrics::counter!("conduit_redeliveries_total").increment(1);
                tracing::debug!(
                    exchange_id = %exchange.id(),
                    attempt = redeliveries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure,
                    "Redelivering exchange"
                );

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                exchange.clear_failure();
                exchange.message_mut().set_header(header::REDELIVERY_COUNTER, redeliveries);
                exchange.message_mut().set_header(header::REDELIVERED, true);
            }
        })
    }

    fn name(&self) -> &str {
        self.processor.name()
    }

    fn start(&self) -> Result<(), ConfigError> {
        self.processor.start()
    }

    fn stop(&self) {
        self.processor.stop();
    }
}
