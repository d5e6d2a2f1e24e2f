//! Bounded buffer of exchanges kept for inspection.
//!
//! A [`BrowseEndpoint`] records every exchange sent to it, then hands the
//! exchange to an optional consumer. With a limit `N > 0` the buffer keeps the
//! latest `N` exchanges: when full, the oldest entries are evicted so that
//! `N - 1` remain before the new one is appended. A limit of `0` keeps
//! everything.
//!
//! Entries are stored behind [`Arc`], so an insert moves one pointer and a
//! read copies pointers, never bodies. Readers get a snapshot taken under a
//! short lock and can iterate it while writers keep inserting; they never
//! observe a half-applied eviction.
//!
//! # Example
//!
//! ```
//! use conduit_core::prelude::*;
//! use conduit_runtime::browse::BrowseEndpoint;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let browse = BrowseEndpoint::new("audit", 3);
//! for body in ["A", "B", "C", "D", "E"] {
//!     browse.process(&mut Exchange::with_body(json!(body))).await.unwrap();
//! }
//!
//! let bodies: Vec<_> = browse.exchanges().iter().map(|e| e.body().clone()).collect();
//! assert_eq!(bodies, vec![json!("C"), json!("D"), json!("E")]);
//! # }
//! ```

use crate::scheduler::capture;
use arc_swap::ArcSwapOption;
use conduit_core::expression::Predicate;
use conduit_core::processor::ProcessFuture;
use conduit_core::{ConfigError, Exchange, Processor, SharedProcessor};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Buffer = Option<VecDeque<Arc<Exchange>>>;

/// A browsable, optionally bounded, endpoint.
pub struct BrowseEndpoint {
    name: String,
    label: String,
    limit: usize,
    accept: Option<Predicate>,
    buffer: Mutex<Buffer>,
    consumer: ArcSwapOption<SharedProcessor>,
}

impl BrowseEndpoint {
    /// Create an endpoint keeping at most `limit` exchanges (`0` = unlimited).
    #[must_use]
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        let name = name.into();
        Self {
            label: format!("browse:{name}"),
            name,
            limit,
            accept: None,
            buffer: Mutex::new(Some(VecDeque::new())),
            consumer: ArcSwapOption::empty(),
        }
    }

    /// Only record exchanges matching `accept`.
    #[must_use]
    pub fn with_filter(mut self, accept: Predicate) -> Self {
        self.accept = Some(accept);
        self
    }

    /// Endpoint name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Register the processor fired after each recorded exchange.
    pub fn set_consumer(&self, consumer: SharedProcessor) {
        self.consumer.store(Some(Arc::new(consumer)));
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<Exchange>> {
        self.lock()
            .as_ref()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record `exchange`, evicting the oldest entries when full.
    ///
    /// A stopped buffer is recreated.
    pub fn on_add(&self, exchange: &Exchange) {
        let limit = self.limit;
        let entry = Arc::new(exchange.clone());

        let evicted = {
            let mut buffer = self.lock();
            let entries = buffer.get_or_insert_with(VecDeque::new);
            let mut evicted = 0;
            if limit > 0 && entries.len() >= limit {
                evicted = entries.len() - (limit - 1);
                entries.drain(..evicted);
            }
            entries.push_back(entry);
            evicted
        };

        if evicted > 0 {
            metrics::counter!("conduit_browse_evicted_total", "endpoint" => self.name.clone())
                .increment(u64::try_from(evicted).unwrap_or(u64::MAX));
            tracing::warn!(endpoint = %self.name, evicted, limit, "Browse buffer full, evicted oldest exchanges");
        }
    }

    /// Snapshot of every recorded exchange, oldest first.
    #[must_use]
    pub fn exchanges(&self) -> Vec<Arc<Exchange>> {
        self.snapshot()
    }

    /// Up to `limit` recorded exchanges matching `filter`, oldest first.
    ///
    /// A `limit` of `0` returns every match.
    #[must_use]
    pub fn exchanges_matching(&self, limit: usize, filter: Option<&Predicate>) -> Vec<Arc<Exchange>> {
        let take = if limit == 0 { usize::MAX } else { limit };
        self.snapshot()
            .into_iter()
            .filter(|exchange| filter.is_none_or(|filter| filter.matches(exchange)))
            .take(take)
            .collect()
    }

    /// Number of recorded exchanges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, VecDeque::len)
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Processor for BrowseEndpoint {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            if self.accept.as_ref().is_some_and(|accept| !accept.matches(exchange)) {
                return Ok(());
            }
            self.on_add(exchange);

            let consumer = self.consumer.load_full();
            if let Some(consumer) = consumer {
                capture(consumer.as_ref().as_ref(), exchange).await;
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.label
    }

    fn start(&self) -> Result<(), ConfigError> {
        self.lock().get_or_insert_with(VecDeque::new);
        Ok(())
    }

    fn stop(&self) {
        *self.lock() = None;
        tracing::debug!(endpoint = %self.name, "Browse buffer cleared");
    }
}
