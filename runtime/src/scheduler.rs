//! Drives exchanges through processors.
//!
//! The [`Scheduler`] implements the continuation contract: every call to
//! [`Scheduler::execute`] invokes its continuation exactly once, either on the
//! calling thread (the processor finished synchronously) or later on the
//! async runtime (the processor had to wait).
//!
//! Errors and panics raised by processors never cross the scheduler. They are
//! captured onto the exchange's failure slot by [`capture`].
//!
//! # Example
//!
//! ```
//! use conduit_core::prelude::*;
//! use conduit_runtime::scheduler::Scheduler;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let scheduler = Scheduler::current();
//! let step = processor_fn("greet", |exchange| {
//!     exchange.set_body(json!("Hello"));
//!     Ok(())
//! });
//!
//! let sync = scheduler.execute(Exchange::new(), step, |exchange, sync| {
//!     assert!(sync);
//!     assert_eq!(exchange.body(), &json!("Hello"));
//! });
//! assert!(sync);
//! # }
//! ```

use crate::error::RoutingError;
use conduit_core::{Exchange, Failure, Processor, SharedProcessor};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::runtime::Handle;

/// Run `processor` and record any error or panic on the exchange.
///
/// Returns once the processor completed. A processor that returns `Err` has
/// its failure stored on the exchange; one that panics gets a
/// [`RoutingError::ProcessorPanicked`] failure.
pub async fn capture(processor: &dyn Processor, exchange: &mut Exchange) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(async { processor.process(exchange).await })
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(failure)) => Some(failure),
        Err(payload) => Some(Failure::from(RoutingError::ProcessorPanicked {
            processor: processor.name().to_string(),
            message: panic_message(payload.as_ref()),
        })),
    };

    metrics::histogram!("conduit_processing_duration_seconds", "processor" => processor.name().to_string())
        .record(started.elapsed().as_secs_f64());

    if let Some(failure) = failure {
        tracing::debug!(
            exchange_id = %exchange.id(),
            processor = processor.name(),
            error = %failure,
            "Processor failed"
        );
        exchange.set_failure(failure);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Executes exchanges with completion continuations.
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// Create a scheduler spawning deferred work on `handle`.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a scheduler on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Drive `exchange` through `processor` and hand it to `continuation`.
    ///
    /// The processor is polled once on the calling thread. If it completes,
    /// the continuation runs immediately with `sync = true` and `execute`
    /// returns `true`. Otherwise the remaining work is spawned on the runtime,
    /// `execute` returns `false`, and the continuation later runs with
    /// `sync = false`. Either way it runs exactly once.
    pub fn execute<C>(&self, exchange: Exchange, processor: SharedProcessor, continuation: C) -> bool
    where
        C: FnOnce(Exchange, bool) + Send + 'static,
    {
        let _entered = self.handle.enter();
        let mut task = Box::pin(Self::run(exchange, processor));
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());

        match task.as_mut().poll(&mut cx) {
            Poll::Ready(exchange) => {
                continuation(exchange, true);
                true
            },
            Poll::Pending => {
                self.handle.spawn(async move {
                    let exchange = task.await;
                    continuation(exchange, false);
                });
                false
            },
        }
    }

    /// Drive `exchange` through `processor` and return it.
    #[tracing::instrument(skip_all, fields(exchange_id = %exchange.id(), processor = processor.name()))]
    pub async fn run(mut exchange: Exchange, processor: SharedProcessor) -> Exchange {
        metrics::counter!("conduit_exchanges_total").increment(1);
        capture(processor.as_ref(), &mut exchange).await;
        if exchange.is_failed() {
            metrics::counter!("conduit_exchanges_failed_total").increment(1);
        }
        exchange
    }
}
