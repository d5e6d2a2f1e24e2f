use crate::scheduler::capture;
use conduit_core::processor::ProcessFuture;
use conduit_core::{Exchange, Processor, SharedProcessor};
use smallvec::SmallVec;

/// Whether routing should move on to the next step.
///
/// Stops on a failure, a route-stop request, a rollback mark, or once an
/// error handler has handled the exchange.
#[must_use]
pub fn should_continue(exchange: &Exchange) -> bool {
    !(exchange.is_failed()
        || exchange.is_route_stop()
        || exchange.is_rollback_only()
        || exchange.is_rollback_only_last()
        || exchange.error_handler_handled() == Some(true))
}

/// Runs its steps in order.
pub struct Pipeline {
    name: String,
    steps: SmallVec<[SharedProcessor; 4]>,
}

impl Pipeline {
    /// Create a pipeline over `steps`.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: impl IntoIterator<Item = SharedProcessor>) -> Self {
        Self {
            name: name.into(),
            steps: steps.into_iter().collect(),
        }
    }

    /// The steps, in order.
    #[must_use]
    pub fn steps(&self) -> &[SharedProcessor] {
        &self.steps
    }
}

impl Processor for Pipeline {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            for step in &self.steps {
                if !should_continue(exchange) {
                    tracing::debug!(
                        exchange_id = %exchange.id(),
                        pipeline = %self.name,
                        "Stopping pipeline"
                    );
                    break;
                }
                capture(step.as_ref(), exchange).await;
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), conduit_core::ConfigError> {
        self.steps.iter().try_for_each(|step| step.start())
    }

    fn stop(&self) {
        for step in self.steps.iter().rev() {
            step.stop();
        }
    }
}
