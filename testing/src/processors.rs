//! Processors with scripted behaviour.

use conduit_core::processor::ProcessFuture;
use conduit_core::{Exchange, Failure, Processor};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// The error raised by [`FailingProcessor`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TestError(pub String);

/// Sleeps, then sets the body to its name.
///
/// Useful for timeouts and for observing asynchronous completion.
#[derive(Debug, Clone)]
pub struct DelayProcessor {
    name: String,
    delay: Duration,
}

impl DelayProcessor {
    /// Create a processor sleeping for `delay`
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

impl Processor for DelayProcessor {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            exchange.set_body(json!(self.name));
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fails with a [`TestError`], optionally only for the first few calls.
///
/// # Example
///
/// ```
/// use conduit_core::prelude::*;
/// use conduit_testing::FailingProcessor;
///
/// # #[tokio::main]
/// # async fn main() {
/// let flaky = FailingProcessor::new("boom").times(1);
///
/// assert!(flaky.process(&mut Exchange::new()).await.is_err());
/// assert!(flaky.process(&mut Exchange::new()).await.is_ok());
/// assert_eq!(flaky.calls(), 2);
/// # }
/// ```
#[derive(Debug)]
pub struct FailingProcessor {
    message: String,
    failures: Option<usize>,
    calls: AtomicUsize,
}

impl FailingProcessor {
    /// Fail every call with `message`
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failures: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Only fail the first `failures` calls
    #[must_use]
    pub const fn times(mut self, failures: usize) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Calls so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for FailingProcessor {
    fn process<'a>(&'a self, _exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.is_none_or(|failures| call < failures) {
                return Err(Failure::new(TestError(self.message.clone())));
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_carries_test_error() {
        let failing = FailingProcessor::new("boom");

        let failure = failing.process(&mut Exchange::new()).await.unwrap_err();

        assert_eq!(failure.downcast_ref::<TestError>(), Some(&TestError("boom".to_string())));
    }

    #[tokio::test]
    async fn test_delay_sets_body_to_name() {
        let delay = DelayProcessor::new("slow", Duration::from_millis(5));
        let mut exchange = Exchange::new();

        delay.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.body(), &json!("slow"));
    }
}
