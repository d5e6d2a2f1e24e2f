//! # Conduit Runtime
//!
//! Runtime for the Conduit mediation engine.
//!
//! This crate drives exchanges through routes built from the traits in
//! `conduit-core`, and provides the processors, strategies and services that
//! routes are assembled from.
//!
//! ## Core Components
//!
//! - **Scheduler**: Runs processors with exactly-once completion continuations
//! - **Processors**: Pipeline, choice, multicast, enricher, send and simple setters
//! - **Error Handler**: Redelivery with back-off, exception clauses, dead letter channel
//! - **Resilience**: Circuit breaker and the fallback-aware resilience command
//! - **Service Call**: Discovery, filtering and load-balanced dispatch with tiered configuration
//! - **Route Context**: Route compilation, ids, lifecycle, templates and health
//!
//! ## Example
//!
//! ```
//! use conduit_core::prelude::*;
//! use conduit_runtime::context::{RouteContext, RouteDefinition};
//! use conduit_testing::MockEndpoints;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), ConfigError> {
//! let endpoints = MockEndpoints::new();
//! let context = RouteContext::new(Arc::new(endpoints.clone()));
//!
//! let route = context.add_route(
//!     RouteDefinition::new("direct:orders")
//!         .set_header("source", "web")
//!         .to("mock:orders"),
//! )?;
//! context.start()?;
//!
//! let exchange = context.send(&route, Exchange::with_body(json!({"id": 1}))).await?;
//! assert_eq!(exchange.header("source"), Some(&json!("web")));
//! assert_eq!(endpoints.endpoint("mock:orders").received_count(), 1);
//! # Ok(())
//! # }
//! ```

/// Bounded browsable endpoints
pub mod browse;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Service discovery, filtering, load balancing and service calls
pub mod cloud;

/// TOML configuration
pub mod config;

pub mod context;

/// Data-set index validation
pub mod dataset;

pub mod dead_letter;

pub mod error;

pub mod error_handler;

pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

pub mod processors;

/// Hystrix-style commands with fallback
pub mod resilience;

pub mod scheduler;

pub use context::{RouteContext, RouteDefinition};
pub use error::RoutingError;
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use scheduler::Scheduler;
