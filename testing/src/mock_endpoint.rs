//! Recording endpoints for route tests
//!
//! - [`MockEndpoint`]: records every exchange it receives, checks expectations
//! - [`MockEndpoints`]: an [`EndpointResolver`] handing out shared mocks by uri

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use conduit_core::environment::EndpointResolver;
use conduit_core::processor::ProcessFuture;
use conduit_core::{Exchange, Failure, Processor, SharedProcessor};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Expectations {
    count: Option<usize>,
    bodies: Option<Vec<Value>>,
}

#[derive(Debug)]
struct MockState {
    uri: String,
    received: RwLock<Vec<Exchange>>,
    expectations: RwLock<Expectations>,
    reply: RwLock<Option<Value>>,
    failure: RwLock<Option<String>>,
    arrived: Notify,
}

/// An endpoint that records what it receives.
///
/// Clones share state, so a test can keep a handle while the route holds
/// another.
///
/// # Example
///
/// ```
/// use conduit_core::prelude::*;
/// use conduit_testing::MockEndpoint;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mock = MockEndpoint::new("mock:result");
/// mock.expect_message_count(1);
/// mock.set_reply_body(json!("pong"));
///
/// let mut exchange = Exchange::with_body(json!("ping"));
/// mock.process(&mut exchange).await.unwrap();
///
/// assert_eq!(exchange.body(), &json!("pong"));
/// assert_eq!(mock.received_bodies(), vec![json!("ping")]);
/// mock.assert_is_satisfied();
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MockEndpoint {
    state: Arc<MockState>,
}

impl MockEndpoint {
    /// Create a mock for `uri`
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            state: Arc::new(MockState {
                uri: uri.into(),
                received: RwLock::new(Vec::new()),
                expectations: RwLock::new(Expectations::default()),
                reply: RwLock::new(None),
                failure: RwLock::new(None),
                arrived: Notify::new(),
            }),
        }
    }

    /// The endpoint uri
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.state.uri
    }

    /// Replace the body of every exchange received from now on
    pub fn set_reply_body(&self, body: impl Into<Value>) {
        *self.state.reply.write().unwrap() = Some(body.into());
    }

    /// Fail every exchange received from now on with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.state.failure.write().unwrap() = Some(message.into());
    }

    /// Expect exactly `count` exchanges
    pub fn expect_message_count(&self, count: usize) {
        self.state.expectations.write().unwrap().count = Some(count);
    }

    /// Expect these bodies, in order
    pub fn expect_bodies_received(&self, bodies: Vec<Value>) {
        let mut expectations = self.state.expectations.write().unwrap();
        expectations.count = Some(bodies.len());
        expectations.bodies = Some(bodies);
    }

    /// Number of exchanges received
    #[must_use]
    pub fn received_count(&self) -> usize {
        self.state.received.read().unwrap().len()
    }

    /// Copies of the exchanges received, as they arrived
    #[must_use]
    pub fn received_exchanges(&self) -> Vec<Exchange> {
        self.state.received.read().unwrap().clone()
    }

    /// Bodies of the exchanges received
    #[must_use]
    pub fn received_bodies(&self) -> Vec<Value> {
        self.state
            .received
            .read()
            .unwrap()
            .iter()
            .map(|exchange| exchange.body().clone())
            .collect()
    }

    /// Forget received exchanges, expectations and behaviour
    pub fn reset(&self) {
        self.state.received.write().unwrap().clear();
        *self.state.expectations.write().unwrap() = Expectations::default();
        *self.state.reply.write().unwrap() = None;
        *self.state.failure.write().unwrap() = None;
    }

    /// Wait until at least `count` exchanges arrived
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let arrived = self.state.arrived.notified();
                if self.received_count() >= count {
                    return;
                }
                arrived.await;
            }
        })
        .await
        .is_ok()
    }

    /// Check the expectations
    ///
    /// # Panics
    ///
    /// Panics with a description of the first unmet expectation.
    #[allow(clippy::panic)] // Test code can panic
    pub fn assert_is_satisfied(&self) {
        let expectations = self.state.expectations.read().unwrap();
        let received = self.received_count();

        if let Some(count) = expectations.count {
            assert_eq!(
                received, count,
                "{}: expected {count} messages but received {received}",
                self.state.uri
            );
        }
        if let Some(bodies) = &expectations.bodies {
            let actual = self.received_bodies();
            if &actual != bodies {
                panic!("{}: expected bodies {bodies:?} but received {actual:?}", self.state.uri);
            }
        }
    }
}

impl Processor for MockEndpoint {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            self.state.received.write().unwrap().push(exchange.clone());
            self.state.arrived.notify_waiters();

            if let Some(message) = self.state.failure.read().unwrap().clone() {
                return Err(Failure::msg(message));
            }
            if let Some(body) = self.state.reply.read().unwrap().clone() {
                exchange.set_body(body);
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.state.uri
    }
}

/// Resolves endpoint uris to shared mocks.
///
/// `mock:` uris are created on first use. Other uris resolve only once a
/// test asked for them through [`endpoint`](Self::endpoint) or bound a
/// processor with [`bind`](Self::bind).
///
/// # Example
///
/// ```
/// use conduit_core::environment::EndpointResolver;
/// use conduit_testing::MockEndpoints;
///
/// let endpoints = MockEndpoints::new();
/// assert!(endpoints.resolve_endpoint("mock:result").is_some());
/// assert!(endpoints.resolve_endpoint("http:localhost:8081").is_none());
///
/// let service = endpoints.endpoint("http:localhost:8081");
/// assert!(endpoints.resolve_endpoint("http:localhost:8081").is_some());
/// assert_eq!(service.received_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MockEndpoints {
    mocks: Arc<DashMap<String, MockEndpoint>>,
    bound: Arc<DashMap<String, SharedProcessor>>,
}

impl MockEndpoints {
    /// Create an empty resolver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock for `uri`, created if needed
    #[must_use]
    pub fn endpoint(&self, uri: &str) -> MockEndpoint {
        self.mocks
            .entry(uri.to_string())
            .or_insert_with(|| MockEndpoint::new(uri))
            .value()
            .clone()
    }

    /// Resolve `uri` to `processor` instead of a mock
    pub fn bind(&self, uri: impl Into<String>, processor: SharedProcessor) {
        self.bound.insert(uri.into(), processor);
    }

    /// Uris of the mocks created so far, sorted
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.mocks.iter().map(|entry| entry.key().clone()).collect();
        uris.sort();
        uris
    }

    /// Check every mock's expectations
    ///
    /// # Panics
    ///
    /// Panics on the first unmet expectation.
    pub fn assert_is_satisfied(&self) {
        for uri in self.uris() {
            self.endpoint(&uri).assert_is_satisfied();
        }
    }
}

impl fmt::Debug for MockEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<String> = self.bound.iter().map(|entry| entry.key().clone()).collect();
        bound.sort();
        f.debug_struct("MockEndpoints")
            .field("mocks", &self.uris())
            .field("bound", &bound)
            .finish_non_exhaustive()
    }
}

impl EndpointResolver for MockEndpoints {
    fn resolve_endpoint(&self, uri: &str) -> Option<SharedProcessor> {
        if let Some(processor) = self.bound.get(uri) {
            return Some(Arc::clone(processor.value()));
        }
        if let Some(mock) = self.mocks.get(uri) {
            return Some(Arc::new(mock.value().clone()));
        }
        uri.starts_with("mock:")
            .then(|| Arc::new(self.endpoint(uri)) as SharedProcessor)
    }
}
