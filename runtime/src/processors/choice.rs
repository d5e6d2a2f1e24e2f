use crate::scheduler::capture;
use conduit_core::expression::Predicate;
use conduit_core::processor::ProcessFuture;
use conduit_core::{ConfigError, Exchange, Processor, SharedProcessor};

/// Content-based router.
///
/// The first `when` clause whose predicate matches handles the exchange. When
/// none match, `otherwise` runs if present; otherwise the exchange passes
/// through untouched.
pub struct Choice {
    whens: Vec<(Predicate, SharedProcessor)>,
    otherwise: Option<SharedProcessor>,
}

impl Choice {
    /// An empty router.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            whens: Vec::new(),
            otherwise: None,
        }
    }

    /// Add a clause.
    #[must_use]
    pub fn when(mut self, predicate: Predicate, processor: SharedProcessor) -> Self {
        self.whens.push((predicate, processor));
        self
    }

    /// Set the fallback branch.
    #[must_use]
    pub fn otherwise(mut self, processor: SharedProcessor) -> Self {
        self.otherwise = Some(processor);
        self
    }

    fn select(&self, exchange: &Exchange) -> Option<&SharedProcessor> {
        self.whens
            .iter()
            .find(|(predicate, _)| predicate.matches(exchange))
            .map(|(_, processor)| processor)
            .or(self.otherwise.as_ref())
    }

    fn branches(&self) -> impl Iterator<Item = &SharedProcessor> {
        self.whens.iter().map(|(_, p)| p).chain(self.otherwise.iter())
    }
}

impl Default for Choice {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Choice {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            if let Some(branch) = self.select(exchange) {
                tracing::debug!(exchange_id = %exchange.id(), branch = branch.name(), "Choice selected branch");
                capture(branch.as_ref(), exchange).await;
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "choice"
    }

    fn start(&self) -> Result<(), ConfigError> {
        self.branches().try_for_each(|branch| branch.start())
    }

    fn stop(&self) {
        self.branches().for_each(|branch| branch.stop());
    }
}
