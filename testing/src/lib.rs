//! # Conduit Testing
//!
//! Testing utilities and helpers for the Conduit mediation engine.
//!
//! This crate provides:
//! - [`MockEndpoint`] and the [`MockEndpoints`] resolver, recording what routes send
//! - Processors with scripted behaviour ([`DelayProcessor`], [`FailingProcessor`])
//! - [`RouteTest`], a Given-When-Then harness for single routes
//! - Context and tracing setup for tests
//!
//! ## Example
//!
//! ```
//! use conduit_core::prelude::*;
//! use conduit_runtime::context::RouteDefinition;
//! use conduit_testing::{MockEndpoints, test_context};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let endpoints = MockEndpoints::new();
//! let context = test_context(&endpoints);
//! let result = endpoints.endpoint("mock:result");
//! result.expect_bodies_received(vec![json!("hello")]);
//!
//! let id = context.add_route(RouteDefinition::new("direct:start").to("mock:result")).unwrap();
//! context.start().unwrap();
//! context.send(&id, Exchange::with_body(json!("hello"))).await.unwrap();
//!
//! result.assert_is_satisfied();
//! # }
//! ```

use conduit_runtime::context::RouteContext;
use std::sync::Arc;

mod mock_endpoint;
mod processors;

pub use mock_endpoint::{MockEndpoint, MockEndpoints};
pub use processors::{DelayProcessor, FailingProcessor, TestError};
pub use route_test::{RouteTest, assertions};

/// A context whose endpoints resolve through `endpoints`.
#[must_use]
pub fn test_context(endpoints: &MockEndpoints) -> RouteContext {
    RouteContext::new(Arc::new(endpoints.clone()))
}

/// Install a test-friendly tracing subscriber.
///
/// Honours `RUST_LOG`, writes through the test harness capture, and is safe
/// to call from every test: only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
