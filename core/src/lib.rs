//! # Conduit Core
//!
//! Core traits and types for the Conduit mediation engine.
//!
//! This crate defines the data that flows through a route and the seams that
//! the runtime plugs strategies into. It has no async runtime dependency.
//!
//! ## Core Concepts
//!
//! - **Exchange**: The unit of work, carrying a message, properties and the processing outcome
//! - **Processor**: One step of a route, `(&mut Exchange) → Future<Result<(), Failure>>`
//! - **Failure**: A captured processing error, stored on the exchange rather than thrown
//! - **Aggregation Strategy**: Merges two exchanges into one
//! - **Service Discovery**: Discovery, filter and chooser traits used by service calls
//! - **Environment**: Injected collaborators (properties, endpoints, clock)
//!
//! ## Example
//!
//! ```
//! use conduit_core::prelude::*;
//! use serde_json::json;
//!
//! let strategy = UseLatestAggregationStrategy;
//! let first = Exchange::with_body(json!("first"));
//! let second = Exchange::with_body(json!("second"));
//!
//! let merged = strategy.aggregate(Some(first), Some(second)).unwrap();
//! assert_eq!(merged.body(), &json!("second"));
//! ```

pub mod aggregation;
pub mod cloud;
pub mod environment;
pub mod error;
pub mod exchange;
pub mod expression;
pub mod failure;
pub mod processor;

pub use error::ConfigError;
pub use exchange::{Exchange, ExchangeId, Message};
pub use failure::Failure;
pub use processor::{ProcessFuture, Processor, SharedProcessor};

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;

/// Commonly used items.
pub mod prelude {
    pub use crate::aggregation::{
        AggregationStrategy, UseLatestAggregationStrategy, UseOriginalAggregationStrategy,
        UseResourceMessageStrategy,
    };
    pub use crate::cloud::{ServiceChooser, ServiceDefinition, ServiceDiscovery, ServiceFilter};
    pub use crate::environment::{EndpointResolver, MapPropertyResolver, PropertyResolver};
    pub use crate::error::ConfigError;
    pub use crate::exchange::{Exchange, ExchangeId, Message, header, property};
    pub use crate::expression::{Expression, Predicate, SimpleTemplate};
    pub use crate::failure::Failure;
    pub use crate::processor::{
        FnProcessor, NoopProcessor, ProcessFuture, Processor, SharedProcessor, processor_fn,
    };
}
