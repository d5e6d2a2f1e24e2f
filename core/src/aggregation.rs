//! Aggregation strategies.
//!
//! An [`AggregationStrategy`] merges two exchanges into one. Multicast folds
//! branch results with it, starting from no accumulated value; enrichment
//! merges the resource exchange into the original.
//!
//! `aggregate(None, None)` has no meaningful result and returns `None`; every
//! other combination returns an exchange.

use crate::exchange::{Exchange, property};

/// Merges an accumulated exchange with the next one.
pub trait AggregationStrategy: Send + Sync {
    /// Merge `new` into `old`.
    ///
    /// - `(None, Some(new))` seeds the aggregation
    /// - `(Some(old), None)` finalizes it
    fn aggregate(&self, old: Option<Exchange>, new: Option<Exchange>) -> Option<Exchange>;
}

/// Keeps the most recent exchange, carrying failures forward.
///
/// If the previous exchange failed, the failure and failure endpoint are
/// copied onto the new one so a later success cannot hide an earlier error.
/// The old exchange wins only when it is marked rollback-only,
/// rollback-only-last, or handled by an error handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatestAggregationStrategy;

impl UseLatestAggregationStrategy {
    /// Only called when `new` has no failure of its own. The failure endpoint
    /// follows the old exchange even when that means removing it.
    fn propagate_failure(old: &Exchange, new: &mut Exchange) {
        if let Some(failure) = old.failure() {
            new.set_failure(failure.clone());
        }
        new.replace_property(
            property::FAILURE_ENDPOINT,
            old.property(property::FAILURE_ENDPOINT).cloned(),
        );
    }

    fn choose(old: Exchange, new: Exchange) -> Exchange {
        if old.is_failed()
            || old.is_rollback_only()
            || old.is_rollback_only_last()
            || old.error_handler_handled() == Some(true)
        {
            old
        } else {
            new
        }
    }
}

impl AggregationStrategy for UseLatestAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Option<Exchange>) -> Option<Exchange> {
        let Some(mut new) = new else {
            return old;
        };
        let Some(old) = old else {
            return Some(new);
        };

        if !new.is_failed() {
            Self::propagate_failure(&old, &mut new);
        }
        if new.is_failed() {
            return Some(new);
        }
        Some(Self::choose(old, new))
    }
}

/// Keeps the first exchange, optionally adopting later failures.
#[derive(Debug, Clone, Copy)]
pub struct UseOriginalAggregationStrategy {
    propagate_failures: bool,
}

impl UseOriginalAggregationStrategy {
    /// Create the strategy. With `propagate_failures`, a failure of any merged
    /// exchange is copied onto the original unless it already failed.
    #[must_use]
    pub const fn new(propagate_failures: bool) -> Self {
        Self { propagate_failures }
    }
}

impl Default for UseOriginalAggregationStrategy {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AggregationStrategy for UseOriginalAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Option<Exchange>) -> Option<Exchange> {
        match (old, new) {
            (Some(mut old), Some(new)) => {
                if self.propagate_failures && !old.is_failed() {
                    if let Some(failure) = new.failure() {
                        old.set_failure(failure.clone());
                    }
                }
                Some(old)
            },
            (old, new) => old.or(new),
        }
    }
}

/// Copies the resource message into the original exchange.
///
/// The default strategy for content enrichment: the original keeps its id and
/// properties, and takes the resource's body and headers. A failed resource
/// transfers its failure instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseResourceMessageStrategy;

impl AggregationStrategy for UseResourceMessageStrategy {
    fn aggregate(&self, original: Option<Exchange>, resource: Option<Exchange>) -> Option<Exchange> {
        match (original, resource) {
            (Some(mut original), Some(resource)) => {
                if let Some(failure) = resource.failure() {
                    original.set_failure(failure.clone());
                } else {
                    original.set_message(resource.message().clone());
                }
                Some(original)
            },
            (original, resource) => original.or(resource),
        }
    }
}
