use crate::error::RoutingError;
use crate::scheduler::capture;
use conduit_core::aggregation::{AggregationStrategy, UseLatestAggregationStrategy};
use conduit_core::processor::ProcessFuture;
use conduit_core::{ConfigError, Exchange, Failure, Processor, SharedProcessor};
use std::sync::Arc;

/// Sends a copy of the exchange to every branch and aggregates the results.
///
/// Results are aggregated in branch order regardless of which branch finished
/// first. The aggregated exchange's results are copied back onto the incoming
/// exchange, which keeps its id.
pub struct Multicast {
    branches: Vec<SharedProcessor>,
    strategy: Arc<dyn AggregationStrategy>,
    parallel: bool,
    stop_on_exception: bool,
}

impl Multicast {
    /// Multicast to `branches`, keeping the latest result.
    #[must_use]
    pub fn new(branches: impl IntoIterator<Item = SharedProcessor>) -> Self {
        Self {
            branches: branches.into_iter().collect(),
            strategy: Arc::new(UseLatestAggregationStrategy),
            parallel: false,
            stop_on_exception: false,
        }
    }

    /// Use a different aggregation strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run branches concurrently on spawned tasks.
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Stop sending to further branches once one fails (sequential mode).
    #[must_use]
    pub const fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    async fn run_sequential(&self, exchange: &Exchange) -> Vec<Exchange> {
        let mut results = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let mut copy = exchange.copy_with_new_id();
            capture(branch.as_ref(), &mut copy).await;
            let failed = copy.is_failed();
            results.push(copy);
            if failed && self.stop_on_exception {
                tracing::debug!(exchange_id = %exchange.id(), branch = branch.name(), "Multicast stopping on exception");
                break;
            }
        }
        results
    }

    async fn run_parallel(&self, exchange: &Exchange) -> Vec<Exchange> {
        let tasks = self.branches.iter().map(|branch| {
            let branch = Arc::clone(branch);
            let mut copy = exchange.copy_with_new_id();
            tokio::spawn(async move {
                capture(branch.as_ref(), &mut copy).await;
                copy
            })
        });

        futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    let mut lost = exchange.copy_with_new_id();
                    lost.set_failure(Failure::from(RoutingError::TaskFailed(e.to_string())));
                    lost
                })
            })
            .collect()
    }
}

impl Processor for Multicast {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            let results = if self.parallel {
                self.run_parallel(exchange).await
            } else {
                self.run_sequential(exchange).await
            };

            let aggregated = results
                .into_iter()
                .fold(None, |acc, next| self.strategy.aggregate(acc, Some(next)));
            if let Some(aggregated) = aggregated {
                exchange.copy_results_from(aggregated);
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "multicast"
    }

    fn start(&self) -> Result<(), ConfigError> {
        self.branches.iter().try_for_each(|branch| branch.start())
    }

    fn stop(&self) {
        self.branches.iter().for_each(|branch| branch.stop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::aggregation::UseOriginalAggregationStrategy;
    use conduit_core::processor::processor_fn;
    use conduit_testing::DelayProcessor;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn set(label: &'static str) -> SharedProcessor {
        processor_fn(label, move |e| {
            e.set_body(json!(label));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_latest_branch_wins_and_id_is_kept() {
        let multicast = Multicast::new([set("a"), set("b"), set("c")]);
        let mut exchange = Exchange::with_body(json!("in"));
        let id = exchange.id().clone();

        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.body(), &json!("c"));
        assert_eq!(exchange.id(), &id);
    }

    #[tokio::test]
    async fn test_parallel_aggregates_in_branch_order() {
        let slow: SharedProcessor = Arc::new(DelayProcessor::new("slow", Duration::from_millis(30)));
        let multicast = Multicast::new([slow, set("fast")]).parallel(true);
        let mut exchange = Exchange::new();

        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.body(), &json!("fast"));
    }

    #[tokio::test]
    async fn test_earlier_failure_survives_later_success() {
        let multicast = Multicast::new([
            processor_fn("fail", |_| Err(Failure::msg("branch a failed"))),
            set("b"),
        ]);
        let mut exchange = Exchange::new();

        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.failure().unwrap().to_string(), "branch a failed");
    }

    #[tokio::test]
    async fn test_stop_on_exception_skips_remaining_branches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let multicast = Multicast::new([
            processor_fn("fail", |_| Err(Failure::msg("stop here"))),
            processor_fn("count", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ])
        .stop_on_exception(true)
        .with_strategy(Arc::new(UseOriginalAggregationStrategy::default()));
        let mut exchange = Exchange::new();

        multicast.process(&mut exchange).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(exchange.is_failed());
    }
}
