use crate::scheduler::capture;
use conduit_core::aggregation::{AggregationStrategy, UseResourceMessageStrategy};
use conduit_core::processor::ProcessFuture;
use conduit_core::{ConfigError, Exchange, Processor, SharedProcessor};
use std::sync::Arc;

/// Content enricher.
///
/// Sends a copy of the exchange to a resource processor and merges the
/// resource's result back using an [`AggregationStrategy`]. By default the
/// resource message replaces the original message.
///
/// A failed resource is not aggregated unless `aggregate_on_exception` is
/// set; its failure is copied onto the original exchange instead.
pub struct Enricher {
    resource: SharedProcessor,
    strategy: Arc<dyn AggregationStrategy>,
    aggregate_on_exception: bool,
}

impl Enricher {
    /// Enrich from `resource` using the default strategy.
    #[must_use]
    pub fn new(resource: SharedProcessor) -> Self {
        Self {
            resource,
            strategy: Arc::new(UseResourceMessageStrategy),
            aggregate_on_exception: false,
        }
    }

    /// Use a custom aggregation strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Hand failed resource exchanges to the strategy as well.
    #[must_use]
    pub const fn aggregate_on_exception(mut self, enabled: bool) -> Self {
        self.aggregate_on_exception = enabled;
        self
    }
}

impl Processor for Enricher {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            let mut resource = exchange.copy_with_new_id();
            capture(self.resource.as_ref(), &mut resource).await;

            if resource.is_failed() && !self.aggregate_on_exception {
                if let Some(failure) = resource.failure() {
                    exchange.set_failure(failure.clone());
                }
                return Ok(());
            }

            if let Some(merged) = self.strategy.aggregate(Some(exchange.clone()), Some(resource)) {
                exchange.copy_results_from(merged);
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "enrich"
    }

    fn start(&self) -> Result<(), ConfigError> {
        self.resource.start()
    }

    fn stop(&self) {
        self.resource.stop();
    }
}
