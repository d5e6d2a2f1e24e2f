//! The processor abstraction.
//!
//! A [`Processor`] is one step of a route. It receives the exchange by mutable
//! reference and returns a boxed future. Processors that finish synchronously
//! return an already-ready future; the scheduler notices and continues on the
//! calling thread. Processors that have to wait (I/O, timers, a remote service)
//! return a pending future and the scheduler finishes them on the async runtime.
//!
//! Processors return `Err` to signal a failure. The scheduler moves that error
//! onto the exchange, so callers only ever see the exchange outcome.
//!
//! # Example
//!
//! ```
//! use conduit_core::processor::{FnProcessor, Processor};
//! use conduit_core::exchange::Exchange;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let upper = FnProcessor::new("upper", |exchange: &mut Exchange| {
//!     let text = exchange.body().as_str().unwrap_or_default().to_uppercase();
//!     exchange.set_body(json!(text));
//!     Ok(())
//! });
//!
//! let mut exchange = Exchange::with_body(json!("hello"));
//! upper.process(&mut exchange).await.unwrap();
//! assert_eq!(exchange.body(), &json!("HELLO"));
//! # }
//! ```

use crate::error::ConfigError;
use crate::exchange::Exchange;
use crate::failure::Failure;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by [`Processor::process`].
pub type ProcessFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Failure>> + Send + 'a>>;

/// A processor shared between routes and tasks.
pub type SharedProcessor = Arc<dyn Processor>;

/// One step of a route.
///
/// # Lifecycle
///
/// [`start`](Processor::start) is called once before the first exchange and
/// [`stop`](Processor::stop) once when the owning route stops. Both default to
/// no-ops.
pub trait Processor: Send + Sync {
    /// Process the exchange.
    ///
    /// # Errors
    ///
    /// Returns the failure that should be recorded on the exchange.
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a>;

    /// Name used in logs and metrics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Prepare the processor for work.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the processor cannot start.
    fn start(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Release resources held by the processor.
    fn stop(&self) {}
}

impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        (**self).process(exchange)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn start(&self) -> Result<(), ConfigError> {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop();
    }
}

/// A synchronous processor built from a closure.
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), Failure> + Send + Sync,
{
    /// Wrap `f` under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), Failure> + Send + Sync,
{
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        let result = (self.f)(exchange);
        Box::pin(std::future::ready(result))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Wrap a closure as a [`SharedProcessor`].
#[must_use]
pub fn processor_fn<F>(name: impl Into<String>, f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> Result<(), Failure> + Send + Sync + 'static,
{
    Arc::new(FnProcessor::new(name, f))
}

/// A processor that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProcessor;

impl Processor for NoopProcessor {
    fn process<'a>(&'a self, _exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(std::future::ready(Ok(())))
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_processor_reports_failure() {
        let failing = processor_fn("failing", |_exchange| Err(Failure::msg("kaboom")));
        let mut exchange = Exchange::with_body(json!(1));

        let result = failing.process(&mut exchange).await;

        assert_eq!(result.unwrap_err().to_string(), "kaboom");
        assert_eq!(failing.name(), "failing");
    }

    #[tokio::test]
    async fn test_shared_processor_delegates() {
        let inner = processor_fn("inc", |exchange| {
            let n = exchange.body().as_i64().unwrap_or(0);
            exchange.set_body(json!(n + 1));
            Ok(())
        });
        let shared: Arc<SharedProcessor> = Arc::new(inner);
        let mut exchange = Exchange::with_body(json!(41));

        shared.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.body(), &json!(42));
        assert_eq!(shared.name(), "inc");
    }
}
